//! Device-to-config matching

use crate::config::DeviceConfig;
use crate::descriptor::DeviceDescriptor;

/// Check whether a descriptor belongs to a configured device
///
/// Unset `vendorid`/`productid` match anything; set ones must equal the
/// descriptor's field exactly, ignoring hex case.
pub fn is_our_device(config: &DeviceConfig, device: &DeviceDescriptor) -> bool {
    if let Some(vendor) = config.vendor_id()
        && !vendor.eq_ignore_ascii_case(&device.vendor_id)
    {
        return false;
    }

    if let Some(product) = config.product_id()
        && !product.eq_ignore_ascii_case(&device.product_id)
    {
        return false;
    }

    true
}
