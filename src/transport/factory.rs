//! # Strategy Factory
//!
//! Maps a [`ConnectionParameters`] variant to a connection strategy through
//! a registry of builders. The default registry knows every transport the
//! platform supports; tests register their own builders (usually the mock).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    ConnectionParameters, ConnectionStrategy, RfcommStrategy, SerialStrategy, TransportKind,
    UsbStrategy,
};
use crate::error::{Result, SdkError};

/// Builds a strategy for one transport kind.
pub type StrategyBuilder =
    Arc<dyn Fn(&ConnectionParameters) -> Result<Box<dyn ConnectionStrategy>> + Send + Sync>;

/// Registry of strategy builders, keyed by transport kind.
#[derive(Clone)]
pub struct StrategyFactory {
    builders: HashMap<TransportKind, StrategyBuilder>,
}

impl StrategyFactory {
    /// A factory that supports nothing.
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Register (or replace) the builder for `kind`.
    pub fn register<F>(mut self, kind: TransportKind, builder: F) -> Self
    where
        F: Fn(&ConnectionParameters) -> Result<Box<dyn ConnectionStrategy>> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Arc::new(builder));
        self
    }

    pub fn supports(&self, kind: TransportKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// Build the strategy for `params`. Does not open it.
    pub fn create(&self, params: &ConnectionParameters) -> Result<Box<dyn ConnectionStrategy>> {
        params.validate()?;
        let builder = self
            .builders
            .get(&params.kind())
            .ok_or(SdkError::UnsupportedTransport(params.kind()))?;
        builder(params)
    }
}

impl Default for StrategyFactory {
    fn default() -> Self {
        let factory = Self::empty()
            .register(TransportKind::Serial, |params| match params {
                ConnectionParameters::Serial { port, baud_rate } => {
                    Ok(Box::new(SerialStrategy::new(port.clone(), *baud_rate)))
                }
                other => Err(mismatch(TransportKind::Serial, other)),
            })
            .register(TransportKind::Usb, |params| match params {
                ConnectionParameters::Usb {
                    vendor_id,
                    product_id,
                    serial_number,
                    interface,
                } => Ok(Box::new(UsbStrategy::new(
                    *vendor_id,
                    *product_id,
                    serial_number.clone(),
                    *interface,
                ))),
                other => Err(mismatch(TransportKind::Usb, other)),
            });

        if cfg!(unix) {
            factory.register(TransportKind::ClassicBluetooth, |params| match params {
                ConnectionParameters::ClassicBluetooth {
                    address,
                    device,
                    channel,
                    ..
                } => Ok(Box::new(RfcommStrategy::new(
                    address.clone(),
                    device.clone(),
                    *channel,
                ))),
                other => Err(mismatch(TransportKind::ClassicBluetooth, other)),
            })
        } else {
            factory
        }
    }
}

fn mismatch(expected: TransportKind, params: &ConnectionParameters) -> SdkError {
    SdkError::InvalidParameter(format!(
        "{} builder received {} parameters",
        expected,
        params.kind()
    ))
}

impl fmt::Debug for StrategyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyFactory")
            .field("transports", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}
