pub mod analysis;
pub mod auto_exposure;
pub mod config;
pub mod frame;
pub mod logging;
pub mod mask;
pub mod photometry;
pub mod routine;
pub mod sensor;
pub mod session;
pub mod supervisor;
