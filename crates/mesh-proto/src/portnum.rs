/// Application-layer port number selecting a handler for a [`Data`](crate::generated::Data)
/// payload (see GLOSSARY in the spec). Mirrors Meshtastic's `PortNum` enum; only the
/// ports this gateway dispatches on are named, everything else decodes to [`PortNum::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortNum {
    TextMessage,
    Position,
    NodeInfo,
    Routing,
    Admin,
    Telemetry,
    Traceroute,
    NeighborInfo,
    Paxcounter,
    Unknown(u32),
}

impl From<u32> for PortNum {
    fn from(value: u32) -> Self {
        match value {
            1 => PortNum::TextMessage,
            3 => PortNum::Position,
            4 => PortNum::NodeInfo,
            5 => PortNum::Routing,
            6 => PortNum::Admin,
            67 => PortNum::Telemetry,
            70 => PortNum::Traceroute,
            71 => PortNum::NeighborInfo,
            72 => PortNum::Paxcounter,
            other => PortNum::Unknown(other),
        }
    }
}

impl From<PortNum> for u32 {
    fn from(value: PortNum) -> Self {
        match value {
            PortNum::TextMessage => 1,
            PortNum::Position => 3,
            PortNum::NodeInfo => 4,
            PortNum::Routing => 5,
            PortNum::Admin => 6,
            PortNum::Telemetry => 67,
            PortNum::Traceroute => 70,
            PortNum::NeighborInfo => 71,
            PortNum::Paxcounter => 72,
            PortNum::Unknown(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_ports() {
        for p in [
            PortNum::TextMessage,
            PortNum::Position,
            PortNum::NodeInfo,
            PortNum::Routing,
            PortNum::Admin,
            PortNum::Telemetry,
            PortNum::Traceroute,
            PortNum::NeighborInfo,
            PortNum::Paxcounter,
        ] {
            let raw: u32 = p.into();
            assert_eq!(PortNum::from(raw), p);
        }
    }

    #[test]
    fn unrecognized_port_is_unknown() {
        assert_eq!(PortNum::from(9999), PortNum::Unknown(9999));
    }
}
