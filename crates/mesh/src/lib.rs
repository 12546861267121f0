//! Named-dimension tensors on a processor mesh.
//!
//! Every tensor axis carries a name and a size. Operations align operands by
//! name rather than by position, and a [`MeshLayout`] records which names are
//! split across processors. Computation runs on a single candle device, which
//! is the one-shard case of the distributed contract: halo exchanges and
//! block reshapes produce exactly what the sharded program would.

pub mod error;
pub mod halo;
pub mod layout;
pub mod ops;
pub mod shape;
pub mod tensor;
pub mod variables;

pub use error::{MeshError, Result};
pub use halo::{halo_exchange, left_halo_exchange};
pub use layout::{Mesh, MeshLayout};
pub use shape::{Dimension, Shape};
pub use tensor::MeshTensor;
pub use variables::{Initializer, VariableStore};
