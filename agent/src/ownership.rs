use std::net::Ipv4Addr;

use vipgate_kernel::Backend;

/// Tells whether this node currently holds a VIP.
pub trait Ownership {
    fn is_local(&self, vip: Ipv4Addr) -> vipgate_kernel::Result<bool>;
}

/// Looks the VIP up among the addresses bound to an interface, on every call.
pub struct InterfaceOwnership<'a, B: ?Sized> {
    backend: &'a B,
    interface: &'a str,
}

impl<'a, B: Backend + ?Sized> InterfaceOwnership<'a, B> {
    pub fn new(backend: &'a B, interface: &'a str) -> Self {
        Self { backend, interface }
    }
}

impl<B: Backend + ?Sized> Ownership for InterfaceOwnership<'_, B> {
    fn is_local(&self, vip: Ipv4Addr) -> vipgate_kernel::Result<bool> {
        Ok(self.backend.addresses(self.interface)?.contains(&vip))
    }
}

#[cfg(test)]
mod tests {
    use vipgate_kernel::memory::MemoryBackend;

    use super::*;

    #[test]
    fn follows_interface_addresses() {
        let vip = Ipv4Addr::new(203, 0, 113, 10);
        let backend = MemoryBackend::new().with_link("eth0", [Ipv4Addr::new(192, 168, 1, 20)]);
        let ownership = InterfaceOwnership::new(&backend, "eth0");

        assert!(!ownership.is_local(vip).unwrap());

        backend.set_addresses("eth0", [Ipv4Addr::new(192, 168, 1, 20), vip]);
        assert!(ownership.is_local(vip).unwrap());

        assert!(InterfaceOwnership::new(&backend, "eth1").is_local(vip).is_err());
    }
}
