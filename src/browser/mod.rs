//! chromiumoxide driver for the support portal

mod portal;
mod wrapper;

pub use portal::ChromePortal;
pub(crate) use wrapper::BrowserWrapper;
