//! Control-service message ids and TLV types shared by the device layer
//! and the QRTR endpoint's local CID synthesis (spec.md 4.2.3, 4.4.4).
//! Values match the real libqmi control service so traces stay readable
//! against existing tooling.

pub(crate) const GET_VERSION_INFO: u16 = 0x0021;
pub(crate) const ALLOCATE_CID: u16 = 0x0022;
pub(crate) const RELEASE_CID: u16 = 0x0023;
pub(crate) const SYNC: u16 = 0x0027;

pub(crate) const TLV_ALLOCATION_INFO: u8 = 0x01;
pub(crate) const TLV_RESULT: u8 = 0x02;
/// `GET_VERSION_INFO` response TLV: a list of `(service, major, minor)` triples.
pub(crate) const TLV_VERSION_LIST: u8 = 0x01;
