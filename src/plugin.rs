//! Registration with the host build.
//!
//! The host exposes two capabilities: attaching a named settings object and
//! accepting a transform stage. Applying the plugin uses both, settings
//! first, because the stage reads them when the host splices it in.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{AmsConfig, BuildSettings};
use crate::pipeline::AmsTransform;
use crate::stage::TransformStage;

/// Name the settings are attached under.
pub const EXTENSION_NAME: &str = "AmsConfig";

pub trait PluginHost {
    fn create_settings(&mut self, name: &str, settings: Arc<BuildSettings>) -> Result<()>;

    fn register_transform(&mut self, stage: Box<dyn TransformStage>) -> Result<()>;
}

pub struct AmsPlugin;

impl AmsPlugin {
    /// Validates `config`, attaches it and registers the transform.
    pub fn apply(host: &mut dyn PluginHost, config: AmsConfig) -> Result<Arc<BuildSettings>> {
        let settings = Arc::new(config.into_settings().context("invalid AmsConfig")?);
        host.create_settings(EXTENSION_NAME, Arc::clone(&settings))?;
        host.register_transform(Box::new(AmsTransform::new(Arc::clone(&settings))))?;
        Ok(settings)
    }
}
