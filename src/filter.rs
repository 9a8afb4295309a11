//! Removing addresses we know we cannot or should not dial.

use std::sync::Arc;

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};

use crate::transport::TransportRegistry;

/// Policy hook blocking individual addresses.
pub trait AddrFilter: Send + Sync + 'static {
    /// Whether dials to `addr` are forbidden by policy.
    fn addr_blocked(&self, addr: &Multiaddr) -> bool;
}

/// Permits every address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AddrFilter for AllowAll {
    fn addr_blocked(&self, _addr: &Multiaddr) -> bool {
        false
    }
}

/// Optional hook selecting the best destination addresses for a peer.
///
/// Applied after [`filter_known_undialables`]; may reorder or shorten
/// the candidate list. Returning an empty list defers to the filtered
/// list unchanged.
pub type BestDestSelector = Arc<dyn Fn(&PeerId, &[Multiaddr]) -> Vec<Multiaddr> + Send + Sync>;

/// Removes addresses that we definitely do not want to dial: addresses
/// we know to be our own, link-local addresses, addresses without a
/// dial-capable transport, and addresses blocked by policy.
///
/// Purely an optimization to avoid dials that are known to fail. The
/// filter is stable: surviving addresses keep their input order, so
/// upstream preference is honored.
pub(crate) fn filter_known_undialables(
    addrs: &[Multiaddr],
    listen_addrs: &[Multiaddr],
    transports: &TransportRegistry,
    filter: &dyn AddrFilter,
) -> Vec<Multiaddr> {
    // We are only sure about filtering out /ip4 and /ip6 listen
    // addresses, so far.
    let our_addrs: Vec<&Multiaddr> = listen_addrs.iter().filter(|a| is_plain_ip(a)).collect();

    addrs
        .iter()
        .filter(|addr| !our_addrs.iter().any(|ours| ours == addr))
        .filter(|addr| addr_over_non_local_ip(addr))
        .filter(|addr| transports.can_dial(addr))
        .filter(|addr| !filter.addr_blocked(addr))
        .cloned()
        .collect()
}

/// A two-protocol address starting with /ip4 or /ip6, the shape our
/// interface listen addresses take.
fn is_plain_ip(addr: &Multiaddr) -> bool {
    let mut protocols = addr.iter();
    let first = protocols.next();
    let ip = matches!(first, Some(Protocol::Ip4(_)) | Some(Protocol::Ip6(_)));
    ip && protocols.next().is_some() && protocols.next().is_none()
}

/// Whether the address is usable from a routing standpoint: addresses
/// over IP must not be link-local. Non-IP stacks are judged by their
/// transport instead.
fn addr_over_non_local_ip(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => !ip.is_link_local(),
        Some(Protocol::Ip6(ip)) => (ip.segments()[0] & 0xffc0) != 0xfe80,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{peer_id, ScriptedTransport};

    struct BlockList(Vec<Multiaddr>);

    impl AddrFilter for BlockList {
        fn addr_blocked(&self, addr: &Multiaddr) -> bool {
            self.0.contains(addr)
        }
    }

    fn tcp_addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn registry_for(addrs: &[Multiaddr]) -> TransportRegistry {
        let transport = ScriptedTransport::new(peer_id());
        for addr in addrs {
            transport.hang(addr.clone());
        }
        let mut registry = TransportRegistry::new();
        registry.register(transport);
        registry
    }

    #[test]
    fn removes_own_listen_addrs() {
        let ours = tcp_addr("/ip4/192.168.1.5/tcp/4001");
        let other = tcp_addr("/ip4/10.0.0.7/tcp/4001");
        let registry = registry_for(&[ours.clone(), other.clone()]);

        let out = filter_known_undialables(
            &[ours.clone(), other.clone()],
            &[ours.clone()],
            &registry,
            &AllowAll,
        );
        assert_eq!(out, vec![other]);
    }

    #[test]
    fn own_addr_comparison_only_applies_to_plain_ip_listen_addrs() {
        // A listen address with more than an ip + transport layer is not
        // subtracted.
        let layered: Multiaddr = "/ip4/1.2.3.4/tcp/4001/ws".parse().unwrap();
        let candidate = layered.clone();
        let registry = registry_for(&[candidate.clone()]);

        let out = filter_known_undialables(&[candidate.clone()], &[layered], &registry, &AllowAll);
        assert_eq!(out, vec![candidate]);
    }

    #[test]
    fn removes_link_local() {
        let v4_link_local = tcp_addr("/ip4/169.254.0.5/tcp/4001");
        let v6_link_local = tcp_addr("/ip6/fe80::1/tcp/4001");
        let good = tcp_addr("/ip4/1.2.3.4/tcp/4001");
        let registry =
            registry_for(&[v4_link_local.clone(), v6_link_local.clone(), good.clone()]);

        let out = filter_known_undialables(
            &[v4_link_local, v6_link_local, good.clone()],
            &[],
            &registry,
            &AllowAll,
        );
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn removes_addrs_without_transport() {
        let known = tcp_addr("/ip4/1.2.3.4/tcp/4001");
        let unknown = tcp_addr("/ip4/1.2.3.4/udp/4001");
        let registry = registry_for(&[known.clone()]);

        let out = filter_known_undialables(&[unknown, known.clone()], &[], &registry, &AllowAll);
        assert_eq!(out, vec![known]);
    }

    #[test]
    fn removes_blocked_addrs_and_preserves_order() {
        let a = tcp_addr("/ip4/1.2.3.1/tcp/1");
        let b = tcp_addr("/ip4/1.2.3.2/tcp/2");
        let c = tcp_addr("/ip4/1.2.3.3/tcp/3");
        let registry = registry_for(&[a.clone(), b.clone(), c.clone()]);
        let filter = BlockList(vec![b.clone()]);

        let out = filter_known_undialables(
            &[a.clone(), b, c.clone()],
            &[],
            &registry,
            &filter,
        );
        assert_eq!(out, vec![a, c]);
    }

    #[test]
    fn best_dest_selector_contract() {
        // The selector itself is applied by the dial engine; here we
        // only pin down that it is a pure reordering function.
        let a = tcp_addr("/ip4/1.2.3.1/tcp/1");
        let b = tcp_addr("/ip4/1.2.3.2/tcp/2");
        let selector: BestDestSelector = Arc::new(|_, addrs| {
            let mut out: Vec<Multiaddr> = addrs.to_vec();
            out.reverse();
            out
        });
        let out = selector(&peer_id(), &[a.clone(), b.clone()]);
        assert_eq!(out, vec![b, a]);
    }
}
