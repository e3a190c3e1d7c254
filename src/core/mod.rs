pub mod bootstrap;
pub mod relay_loop;
pub mod signal;
pub mod summary;
