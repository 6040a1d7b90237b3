//! Transaction-tracking control library for QMI modems, over QMUX, MBIM
//! and QRTR transports (spec.md 1, 4).
//!
//! [`Device`] opens a control endpoint of one of the three kinds, allocates
//! [`Client`]s against QMI services through it, and tracks requests against
//! their responses with the [`TransactionManager`](transaction::TransactionManager)
//! underneath. [`NetPortManager`](netport::NetPortManager) manages the
//! multiplexed data-plane interfaces (rmnet or qmi-wwan) a device's control
//! endpoint rides alongside.

mod client;
pub mod codec;
pub mod config;
mod ctl;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod netport;
pub mod transaction;

pub use client::Client;
pub use codec::{Endianness, Message, MessageBuilder, MessageContext, TlvReader};
pub use config::{DeviceConfig, NetPortConfig};
pub use device::{Device, Path, ServiceVersion};
pub use endpoint::{Endpoint, EndpointKind};
pub use error::{CoreError, CoreResult};
pub use netport::{Link, NetPortBackend, NetPortManager};
pub use transaction::{AbortHooks, CancelToken, Cancellable, TransactionManager};
