pub mod apptainer;
pub mod client_manager;
pub mod config_loader;
pub mod health;
pub mod log_manager;
pub mod monitor_manager;
pub mod recipe_loader;
pub mod registry;
pub mod service_manager;
pub mod slurm;
pub mod state;
