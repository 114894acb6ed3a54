//! Vendor/product name resolution
//!
//! Devices that carry no usable string descriptors can still be labeled by
//! plugging in an external id database. The context caches resolved names
//! per (vendor, product) pair so a resolver is consulted at most once per
//! identity.

use std::collections::HashMap;

/// External vendor/product id database
pub trait NameResolver: Send + Sync {
    fn vendor_name(&self, vendor_id: u16) -> Option<String>;

    fn product_name(&self, vendor_id: u16, product_id: u16) -> Option<String>;
}

/// In-memory resolver backed by explicit tables; mostly useful in tests
#[derive(Default)]
pub struct StaticNames {
    vendors: HashMap<u16, String>,
    products: HashMap<(u16, u16), String>,
}

impl StaticNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vendor(&mut self, vendor_id: u16, name: impl Into<String>) {
        self.vendors.insert(vendor_id, name.into());
    }

    pub fn add_product(&mut self, vendor_id: u16, product_id: u16, name: impl Into<String>) {
        self.products.insert((vendor_id, product_id), name.into());
    }
}

impl NameResolver for StaticNames {
    fn vendor_name(&self, vendor_id: u16) -> Option<String> {
        self.vendors.get(&vendor_id).cloned()
    }

    fn product_name(&self, vendor_id: u16, product_id: u16) -> Option<String> {
        self.products.get(&(vendor_id, product_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_names() {
        let mut names = StaticNames::new();
        names.add_vendor(0x1d6b, "Linux Foundation");
        names.add_product(0x1d6b, 0x0002, "2.0 root hub");

        assert_eq!(
            names.vendor_name(0x1d6b).as_deref(),
            Some("Linux Foundation")
        );
        assert_eq!(
            names.product_name(0x1d6b, 0x0002).as_deref(),
            Some("2.0 root hub")
        );
        assert_eq!(names.vendor_name(0xffff), None);
        assert_eq!(names.product_name(0x1d6b, 0xffff), None);
    }
}
