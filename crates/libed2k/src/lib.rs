//! An eDonkey2000 client engine. The [`Session`] owns transfers; each
//! transfer drives a file identified by its MD4 hash to completion by
//! talking to an index server for sources and to peers for parts.
//!
//! ```no_run
//! use libed2k::{AddTransferParams, Session, SessionSettings};
//! use libed2k_core::ed2k_link::Ed2kLink;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut settings = SessionSettings::default();
//! settings.server_hostname = "emule.example.org".to_owned();
//! let session = Session::new(settings).await?;
//!
//! let link = Ed2kLink::parse(
//!     "ed2k://|file|ubuntu.iso|3654957056|31D6CFE0D16AE931B73C59D7E0C089C0|/",
//! )?;
//! let handle = session.add_transfer(AddTransferParams::from_link(&link, "downloads"))?;
//! while let Some(alert) = session.wait_for_alert(std::time::Duration::from_secs(1)).await {
//!     println!("{alert:?}");
//! }
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
mod bandwidth;
mod buffer_pool;
mod disk;
mod error;
mod peer_connection;
mod piece_picker;
mod policy;
mod server_connection;
mod session;
mod settings;
mod spawn_utils;
mod transfer;
mod type_aliases;

#[cfg(test)]
mod tests;

pub use alerts::{category, Alert};
pub use bandwidth::BandwidthManager;
pub use error::{Error, Result};
pub use session::{Session, TransferHandle};
pub use settings::SessionSettings;
pub use transfer::{AddTransferParams, ResumeData, TransferStatus};

pub fn client_name_and_version() -> String {
    format!("libed2k {}", env!("CARGO_PKG_VERSION"))
}
