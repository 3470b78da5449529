use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use rustc_hash::FxHashSet;

/// One relay direction: traffic received on the `source` group / port is re-sent to the
///  `destination` group / port after the delay. `interface` is the local address used both for
///  joining the source group and for sending; `0.0.0.0` leaves the choice to the OS.
///
/// The textual form is `NAME=SRC_GROUP:SRC_PORT->DST_GROUP:DST_PORT[@INTERFACE]`, e.g.
///  `HAB_IN_to_MCC_OUT=224.0.0.1:20000->224.0.0.1:20013@192.168.1.17`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMapping {
    pub name: String,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub interface: Ipv4Addr,
}

impl RouteMapping {
    pub fn new(name: impl Into<String>, source: SocketAddrV4, destination: SocketAddrV4, interface: Ipv4Addr) -> RouteMapping {
        RouteMapping {
            name: name.into(),
            source,
            destination,
            interface,
        }
    }

    /// The two loops of the OpenVOCS habitat / mission control setup:
    ///  HAB/IN -> MCC/OUT and MCC/IN -> HAB/OUT
    pub fn default_loop_mappings() -> Vec<RouteMapping> {
        let group = Ipv4Addr::new(224, 0, 0, 1);
        vec![
            RouteMapping::new("HAB_IN_to_MCC_OUT", SocketAddrV4::new(group, 20000), SocketAddrV4::new(group, 20013), Ipv4Addr::UNSPECIFIED),
            RouteMapping::new("MCC_IN_to_HAB_OUT", SocketAddrV4::new(group, 20012), SocketAddrV4::new(group, 20011), Ipv4Addr::UNSPECIFIED),
        ]
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            bail!("route name {:?} must be non-empty and must not contain whitespace", self.name);
        }
        for (what, addr) in [("source", self.source), ("destination", self.destination)] {
            if !addr.ip().is_multicast() {
                bail!("route {}: {} {} is not a multicast group", self.name, what, addr.ip());
            }
            if addr.port() == 0 {
                bail!("route {}: {} port must not be 0", self.name, what);
            }
        }
        if self.source == self.destination {
            // packets would be re-broadcast to their own source, multiplying endlessly
            bail!("route {}: source and destination are both {}", self.name, self.source);
        }
        if self.interface.is_multicast() {
            bail!("route {}: interface {} is a multicast address", self.name, self.interface);
        }
        Ok(())
    }

    /// Validates a complete routing table: every mapping must be valid, names must be unique, and
    ///  no two directions may listen on the same source.
    pub fn validate_table(routes: &[RouteMapping]) -> anyhow::Result<()> {
        if routes.is_empty() {
            bail!("no routes configured");
        }

        let mut names = FxHashSet::default();
        let mut sources = FxHashSet::default();
        for route in routes {
            route.validate()?;
            if !names.insert(route.name.as_str()) {
                bail!("duplicate route name {}", route.name);
            }
            if !sources.insert(route.source) {
                bail!("route {}: source {} is used by more than one route", route.name, route.source);
            }
        }
        Ok(())
    }
}

impl FromStr for RouteMapping {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s.split_once('=')
            .ok_or_else(|| anyhow!("route {:?}: expected NAME=SRC_GROUP:SRC_PORT->DST_GROUP:DST_PORT[@INTERFACE]", s))?;
        let (addresses, interface) = match rest.split_once('@') {
            Some((addresses, interface)) => {
                let interface = interface.trim().parse::<Ipv4Addr>()
                    .with_context(|| format!("route {:?}: invalid interface address {:?}", s, interface))?;
                (addresses, interface)
            }
            None => (rest, Ipv4Addr::UNSPECIFIED),
        };
        let (source, destination) = addresses.split_once("->")
            .ok_or_else(|| anyhow!("route {:?}: expected SRC_GROUP:SRC_PORT->DST_GROUP:DST_PORT", s))?;

        let source = source.trim().parse::<SocketAddrV4>()
            .with_context(|| format!("route {:?}: invalid source {:?}", s, source))?;
        let destination = destination.trim().parse::<SocketAddrV4>()
            .with_context(|| format!("route {:?}: invalid destination {:?}", s, destination))?;

        Ok(RouteMapping::new(name.trim(), source, destination, interface))
    }
}

impl Display for RouteMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}->{}@{}", self.name, self.source, self.destination, self.interface)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[rstest]
    #[case::full("A=224.0.0.1:20000->224.0.0.1:20013@192.168.1.17", "A", "224.0.0.1:20000", "224.0.0.1:20013", Ipv4Addr::new(192, 168, 1, 17))]
    #[case::default_interface("A=224.0.0.1:20000->224.0.0.1:20013", "A", "224.0.0.1:20000", "224.0.0.1:20013", Ipv4Addr::UNSPECIFIED)]
    #[case::whitespace(" B = 239.1.2.3:5000 -> 239.1.2.4:5001 @ 10.0.0.1", "B", "239.1.2.3:5000", "239.1.2.4:5001", Ipv4Addr::new(10, 0, 0, 1))]
    fn test_parse(#[case] s: &str, #[case] name: &str, #[case] source: &str, #[case] destination: &str, #[case] interface: Ipv4Addr) {
        let route = s.parse::<RouteMapping>().unwrap();
        assert_eq!(route, RouteMapping::new(name, addr(source), addr(destination), interface));
    }

    #[rstest]
    #[case::no_name("224.0.0.1:20000->224.0.0.1:20013")]
    #[case::no_arrow("A=224.0.0.1:20000,224.0.0.1:20013")]
    #[case::no_port("A=224.0.0.1->224.0.0.1:20013")]
    #[case::bad_interface("A=224.0.0.1:20000->224.0.0.1:20013@eth0")]
    #[case::ipv6("A=[ff02::1]:20000->224.0.0.1:20013")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(s.parse::<RouteMapping>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for route in RouteMapping::default_loop_mappings() {
            assert_eq!(route.to_string().parse::<RouteMapping>().unwrap(), route);
        }
    }

    #[rstest]
    #[case::valid("A", "224.0.0.1:20000", "224.0.0.1:20013", "0.0.0.0", true)]
    #[case::same_group_different_port("A", "224.0.0.1:20000", "224.0.0.1:20001", "0.0.0.0", true)]
    #[case::same_port_different_group("A", "224.0.0.1:20000", "224.0.0.2:20000", "0.0.0.0", true)]
    #[case::loop_to_self("A", "224.0.0.1:20000", "224.0.0.1:20000", "0.0.0.0", false)]
    #[case::unicast_source("A", "10.0.0.1:20000", "224.0.0.1:20013", "0.0.0.0", false)]
    #[case::unicast_destination("A", "224.0.0.1:20000", "10.0.0.1:20013", "0.0.0.0", false)]
    #[case::port_zero("A", "224.0.0.1:0", "224.0.0.1:20013", "0.0.0.0", false)]
    #[case::multicast_interface("A", "224.0.0.1:20000", "224.0.0.1:20013", "224.0.0.5", false)]
    #[case::empty_name("", "224.0.0.1:20000", "224.0.0.1:20013", "0.0.0.0", false)]
    #[case::whitespace_name("A B", "224.0.0.1:20000", "224.0.0.1:20013", "0.0.0.0", false)]
    fn test_validate(#[case] name: &str, #[case] source: &str, #[case] destination: &str, #[case] interface: &str, #[case] expected_valid: bool) {
        let route = RouteMapping::new(name, addr(source), addr(destination), interface.parse().unwrap());
        assert_eq!(route.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_validate_table() {
        RouteMapping::validate_table(&RouteMapping::default_loop_mappings()).unwrap();

        assert!(RouteMapping::validate_table(&[]).is_err());

        let mut duplicate_name = RouteMapping::default_loop_mappings();
        duplicate_name[1].name = duplicate_name[0].name.clone();
        assert!(RouteMapping::validate_table(&duplicate_name).is_err());

        let mut duplicate_source = RouteMapping::default_loop_mappings();
        duplicate_source[1].source = duplicate_source[0].source;
        assert!(RouteMapping::validate_table(&duplicate_source).is_err());
    }
}
