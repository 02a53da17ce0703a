use std::io;

use thiserror::Error;

use crate::cli::CliError;
use crate::image::ImageError;
use crate::protocol::ProtocolError;
use crate::workflow::WorkflowError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    Cli(#[from] CliError),

    #[error("image rejected: {0}")]
    Image(#[from] ImageError),

    #[error("device protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("flash workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
