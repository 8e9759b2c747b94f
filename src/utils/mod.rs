pub mod constants;
mod wait_for_element;

pub use wait_for_element::{find_first, wait_for_any, wait_for_view};
