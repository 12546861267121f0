//! Blocked sliding-window attention against dense masked attention.
//! Run with: `cargo bench -p attention local_vs_dense`

#[path = "common/mod.rs"]
mod util;

use std::error::Error;
use std::time::Instant;

use attention::masks::dense_sliding_window_bias;
use attention::{
    local_attention_1d, multihead_attention, AttentionParams, KernelOptions, LocalAttentionOptions,
    ParamsConfig,
};
use candle_core::{DType, Tensor};
use mesh::{Dimension, Mesh, MeshTensor, Shape, VariableStore};
use util::{format_markdown_table, format_rate, update_results};

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    seq_len: usize,
    window: usize,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("local_vs_dense bench failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mesh = Mesh::cpu();
    let d_model = 64;
    let d_kv = 16;

    let mut cases = Vec::new();
    for &seq_len in &[256usize, 1024, 2048] {
        for &window in &[32usize, 128] {
            cases.push(Case {
                batch: 1,
                heads: 4,
                seq_len,
                window,
            });
        }
    }

    let mut rows = Vec::new();
    for case in cases {
        let iterations = match case.seq_len {
            0..=256 => 20,
            257..=1024 => 5,
            _ => 2,
        };
        let tokens_per_iter = (case.batch * case.seq_len) as f64;
        let store = VariableStore::new();
        let config = ParamsConfig::multihead(
            Dimension::new("d_model", d_model),
            Dimension::new("d_kv", d_kv),
            case.heads,
        )?;
        let params = AttentionParams::new(&mesh, &store, "bench", config)?;
        let length = Dimension::new("length", case.seq_len);
        let x = build_input(&mesh, &case, d_model)?;

        let options = LocalAttentionOptions::causal(case.window);
        let local = measure(iterations, || {
            local_attention_1d(&mesh, &params, &x, &length, &options).map(|_| ())
        })?;
        rows.push(row("blocked", &case, local, tokens_per_iter));

        let memory = Dimension::new("memory_length", case.seq_len);
        let bias = dense_sliding_window_bias(&mesh, &length, &memory, case.window, true, DType::F32)?;
        let kernel = KernelOptions::eval();
        let dense = measure(iterations, || {
            multihead_attention(&params, &x, None, &length, "memory_length", Some(&bias), &kernel)
                .map(|_| ())
        })?;
        rows.push(row("dense", &case, dense, tokens_per_iter));
    }

    let table = format_markdown_table(
        &["engine", "shape (b,h,s)", "window", "tokens/sec"],
        &rows,
    );
    println!("\nLocal vs dense summary:\n{table}");
    update_results("LocalVsDense", &table)?;
    Ok(())
}

fn measure<F>(iterations: usize, mut step: F) -> Result<f64, Box<dyn Error>>
where
    F: FnMut() -> attention::Result<()>,
{
    // Warm-up
    step()?;

    let start = Instant::now();
    for _ in 0..iterations {
        step()?;
    }
    Ok(iterations as f64 / start.elapsed().as_secs_f64())
}

fn row(engine: &str, case: &Case, iters_per_sec: f64, tokens_per_iter: f64) -> Vec<String> {
    vec![
        engine.to_string(),
        format!("({},{},{})", case.batch, case.heads, case.seq_len),
        case.window.to_string(),
        format_rate(iters_per_sec * tokens_per_iter),
    ]
}

fn build_input(mesh: &Mesh, case: &Case, d_model: usize) -> Result<MeshTensor, Box<dyn Error>> {
    let shape = Shape::new(vec![
        Dimension::new("batch", case.batch),
        Dimension::new("length", case.seq_len),
        Dimension::new("d_model", d_model),
    ])?;
    let data = Tensor::rand(-1.0f32, 1.0, shape.sizes(), mesh.device())?;
    Ok(MeshTensor::new(data, shape)?)
}
