pub mod bayes_net;
pub mod config;
pub mod context;
pub mod data;
pub mod embedding;
pub mod error;
pub mod gaussian_net;
pub mod gp;
pub mod io;
pub mod likelihood;
pub mod mapper;
pub mod metrics;
pub mod net;
pub mod prior;
pub mod sghmc;
pub mod stats;
