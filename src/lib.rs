//! `lvm_core`: an on-disk PV metadata engine, an in-memory PV/VG cache,
//! a device-identification matcher, and the persistent devices file and
//! scan-reduction hints file that go with it.
//!
//! This crate speaks lvm2's text metadata format only (no format1/pool
//! legacy support) and stops at the VG/PV envelope -- it does not
//! provision logical volumes or talk to the device-mapper ioctl
//! interface.

pub mod bytes;
pub mod context;
pub mod device;
pub mod device_id;
pub mod devices_file;
pub mod error;
pub mod filter;
pub mod flock;
pub mod hints;
pub mod id_matcher;
pub mod ids;
pub mod label;
pub mod lvmcache;
pub mod parser;
pub mod pvheader;
pub mod vg;

pub use error::{Error, Result};
