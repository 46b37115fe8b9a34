pub mod allocation;
pub mod codec;
pub mod common;
pub mod config;
pub mod demos;
pub mod ir;
pub mod kernel;
pub mod layout;
pub mod lowering;
pub mod pprint;
pub mod ptx;
pub mod smem;
pub mod typeconv;
pub mod types;

pub use smallvec;
