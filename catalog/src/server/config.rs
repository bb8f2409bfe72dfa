use crate::server::Config;
use log::debug;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to read config file {0}: {1}")]
    IO(String, std::io::Error),

    #[error("Unable to deserialize config file {0}: {1}")]
    Parse(String, serde_yml::Error),
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
    let path = path.as_ref();
    let display = path.display().to_string();
    debug!("Loading configuration from {}", display);
    let file = File::open(path).map_err(|e| Error::IO(display.clone(), e))?;
    serde_yml::from_reader(file).map_err(|e| Error::Parse(display, e))
}
