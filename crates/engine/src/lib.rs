pub mod install;
pub mod pipeline;
pub mod resolve;
pub mod services;
pub mod transfer;

pub use pipeline::{create_boot_drive, CreateParams, RunOutcome, DEFAULT_LABEL};
pub use services::{
    BootServices, DiskPreparer, HostContext, ImageMounter, MountGuard, ServiceExit, Services,
};
