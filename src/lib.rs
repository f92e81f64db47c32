//! Balanced HDLC data links: AX.25 and X.25 LAPB connected mode.
//!
//! The heart of this crate is the link state machine in [`state`], with the
//! ARQ procedures it calls on. It does no I/O: feed it frames and local
//! requests, and it hands back frames to send, indications, and data.
//!
//! [`Link`] ties a state machine to its frame codec, and [`LinkTable`] holds
//! many of them. [`Client`] and [`r#async::Client`] run one link over a KISS
//! TNC.
//!
//! ```
//! use hdlcarq::{Config, Event, Link, ReturnEvent};
//!
//! let mut dte = Link::lapb(Config::lapb());
//! let mut dce = Link::lapb(Config::lapb().dce(true));
//! for ev in dte.event(Event::Connect(false)) {
//!     if let Some(bytes) = dte.encode(&ev)? {
//!         for ev in dce.deliver_frame(&bytes) {
//!             if let Some(bytes) = dce.encode(&ev)? {
//!                 dte.deliver_frame(&bytes);
//!             }
//!         }
//!     }
//! }
//! assert!(dte.is_connected());
//! assert!(dce.is_connected());
//! # Ok::<(), anyhow::Error>(())
//! ```
pub mod addr;
mod arq;
pub mod r#async;
pub mod client;
pub mod config;
pub mod frame;
pub mod kiss;
pub mod lapb;
pub mod link;
pub mod packet;
pub mod pcap;
pub mod segment;
pub mod seq;
pub mod state;
pub mod timer;

pub use addr::Addr;
pub use client::Client;
pub use config::{Backoff, Config, Flavour};
pub use frame::Frame;
pub use kiss::{Kiss, Kisser};
pub use link::{Link, LinkError, LinkTable, LinkToken};
pub use packet::Packet;
pub use state::{Cause, Delivery, Event, Indication, LinkState, ReturnEvent};
