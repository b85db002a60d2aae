//! The routing table.
use std::sync::{Arc, Mutex};

use crate::wire::Ipv4Address;

use super::Iface;

/// One routing table entry.
///
/// `nexthop` of `0.0.0.0` means the destination is on-link and is used as
/// the nexthop itself. A default gateway is stored as network `0.0.0.0`,
/// netmask `0.0.0.0`, nexthop the gateway.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) network: Ipv4Address,
    pub(crate) netmask: Ipv4Address,
    pub(crate) nexthop: Ipv4Address,
    pub(crate) iface: Arc<Iface>,
}

/// The routing table, written during setup and searched per datagram.
#[derive(Debug)]
pub(crate) struct Routes {
    storage: Mutex<Vec<Route>>,
}

impl Routes {
    pub(crate) fn new() -> Self {
        Routes { storage: Mutex::new(Vec::new()) }
    }

    pub(crate) fn add(&self, route: Route) {
        log::info!("route added: network={}, netmask={}, nexthop={}, iface={}",
            route.network, route.netmask, route.nexthop, route.iface.unicast);
        self.storage.lock().unwrap().push(route);
    }

    /// Longest-prefix match over all routes.
    ///
    /// Netmasks are compared in network byte order; ties resolve to the
    /// most recently inserted route. A default route matches anything and
    /// loses to every more specific one.
    pub(crate) fn lookup(&self, dst: Ipv4Address) -> Option<Route> {
        let storage = self.storage.lock().unwrap();
        let mut candidate: Option<&Route> = None;
        for route in storage.iter() {
            let masked = dst.to_network_integer() & route.netmask.to_network_integer();
            if masked != route.network.to_network_integer() {
                continue;
            }
            match candidate {
                Some(best)
                    if best.netmask.to_network_integer()
                        > route.netmask.to_network_integer() => {}
                _ => candidate = Some(route),
            }
        }
        candidate.cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Weak;

    fn iface(unicast: Ipv4Address, netmask: Ipv4Address) -> Arc<Iface> {
        Arc::new(Iface::with_dev(unicast, netmask, Weak::new()))
    }

    fn addr(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let routes = Routes::new();
        let wide = iface(addr("10.0.0.1"), addr("255.0.0.0"));
        let narrow = iface(addr("10.1.0.1"), addr("255.255.0.0"));
        routes.add(Route {
            network: addr("10.0.0.0"),
            netmask: addr("255.0.0.0"),
            nexthop: Ipv4Address::UNSPECIFIED,
            iface: wide.clone(),
        });
        routes.add(Route {
            network: addr("10.1.0.0"),
            netmask: addr("255.255.0.0"),
            nexthop: Ipv4Address::UNSPECIFIED,
            iface: narrow.clone(),
        });

        let hit = routes.lookup(addr("10.1.2.3")).unwrap();
        assert_eq!(hit.iface.unicast, narrow.unicast);
        let hit = routes.lookup(addr("10.2.0.1")).unwrap();
        assert_eq!(hit.iface.unicast, wide.unicast);
    }

    #[test]
    fn default_route_loses_to_specific() {
        let routes = Routes::new();
        let lan = iface(addr("192.0.2.2"), addr("255.255.255.0"));
        routes.add(Route {
            network: Ipv4Address::UNSPECIFIED,
            netmask: Ipv4Address::UNSPECIFIED,
            nexthop: addr("192.0.2.1"),
            iface: lan.clone(),
        });
        routes.add(Route {
            network: addr("192.0.2.0"),
            netmask: addr("255.255.255.0"),
            nexthop: Ipv4Address::UNSPECIFIED,
            iface: lan.clone(),
        });

        let on_link = routes.lookup(addr("192.0.2.7")).unwrap();
        assert_eq!(on_link.nexthop, Ipv4Address::UNSPECIFIED);
        let routed = routes.lookup(addr("198.51.100.1")).unwrap();
        assert_eq!(routed.nexthop, addr("192.0.2.1"));
    }

    #[test]
    fn no_route_is_none() {
        let routes = Routes::new();
        let lan = iface(addr("192.0.2.2"), addr("255.255.255.0"));
        routes.add(Route {
            network: addr("192.0.2.0"),
            netmask: addr("255.255.255.0"),
            nexthop: Ipv4Address::UNSPECIFIED,
            iface: lan,
        });
        assert!(routes.lookup(addr("198.51.100.1")).is_none());
    }

    #[test]
    fn ties_resolve_to_most_recent() {
        let routes = Routes::new();
        let first = iface(addr("192.0.2.2"), addr("255.255.255.0"));
        let second = iface(addr("192.0.2.3"), addr("255.255.255.0"));
        for iface in [&first, &second] {
            routes.add(Route {
                network: addr("192.0.2.0"),
                netmask: addr("255.255.255.0"),
                nexthop: Ipv4Address::UNSPECIFIED,
                iface: iface.clone(),
            });
        }
        let hit = routes.lookup(addr("192.0.2.9")).unwrap();
        assert_eq!(hit.iface.unicast, second.unicast);
    }
}
