pub mod acor;
pub mod io;
pub mod loader;
pub mod svd;
