//! Framework lifecycle hooks.
//!
//! The test framework creates every configured controller at testbed
//! setup and destroys them all at the end of the run. Creation is
//! all-or-nothing: if one controller fails to come up, the ones already
//! created are torn down again before the error surfaces, so no serial
//! port stays claimed behind a failed setup.

use log::{debug, warn};

use crate::{
   config::{self, ControllerConfig},
   error::{BesRefError, Result},
   tws::TwsDevice,
};

/// Builds one device per controller entry, rolling back on failure.
pub fn create(configs: &[ControllerConfig]) -> Result<Vec<TwsDevice>> {
   if configs.is_empty() {
      return Err(BesRefError::Config("configuration is empty".to_string()));
   }

   let mut devices = Vec::with_capacity(configs.len());
   for config in configs {
      debug!("Creating controller `{}`", config.controller_name);
      match TwsDevice::from_config(config) {
         Ok(device) => devices.push(device),
         Err(e) => {
            warn!(
               "Controller `{}` failed to come up, rolling back {} device(s)",
               config.controller_name,
               devices.len()
            );
            destroy(&devices);
            return Err(e);
         }
      }
   }
   Ok(devices)
}

/// Parses a testbed YAML document and creates its controllers.
pub fn create_from_yaml(document: &str) -> Result<Vec<TwsDevice>> {
   create(&config::from_yaml(document)?)
}

/// Tears every device down, logging instead of failing so one broken
/// controller cannot keep the rest claimed.
pub fn destroy(devices: &[TwsDevice]) {
   for device in devices {
      let report = device.teardown();
      if !report.is_clean() {
         warn!("Failed to tear down `{}` cleanly: {report}", device.name());
      }
   }
}
