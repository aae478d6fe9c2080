//! Transport ID parsing for `-r`.
//!
//! Syntax: `key:value [key:value] ...` with keys `trtype`, `adrfam`,
//! `traddr`, `trsvcid`, `subnqn`, `ns`, `hostnqn`, plus `size` for the
//! in-memory loopback transport.

use repio::util::parse_capacity;

pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrType {
    Pcie,
    Rdma,
    Tcp,
    /// In-tree RAM loopback target.
    Mem,
}

impl TrType {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcie" => Some(TrType::Pcie),
            "rdma" => Some(TrType::Rdma),
            "tcp" => Some(TrType::Tcp),
            "mem" => Some(TrType::Mem),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TrType::Pcie => "PCIe",
            TrType::Rdma => "RDMA",
            TrType::Tcp => "TCP",
            TrType::Mem => "Mem",
        }
    }
}

// Address-family and service fields are parsed for parity; only hardware
// transports would consume them.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct TransportId {
    pub trtype: TrType,
    pub adrfam: Option<String>,
    pub traddr: String,
    pub trsvcid: Option<String>,
    pub subnqn: String,
    pub nsid: Option<u16>,
    pub hostnqn: Option<String>,
    /// Capacity for the Mem transport.
    pub size_bytes: u64,
}

impl TransportId {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut trid = TransportId {
            trtype: TrType::Pcie,
            adrfam: None,
            traddr: String::new(),
            trsvcid: None,
            subnqn: DISCOVERY_NQN.to_string(),
            nsid: None,
            hostnqn: None,
            size_bytes: 1 << 30,
        };
        for pair in spec.split_whitespace() {
            let Some((key, value)) = pair.split_once(':') else {
                return Err(format!("Invalid transport ID format '{}'", spec));
            };
            if value.is_empty() {
                return Err(format!("Key '{}' without value", key));
            }
            match key.to_ascii_lowercase().as_str() {
                "trtype" => {
                    trid.trtype = TrType::parse(value)
                        .ok_or_else(|| format!("Unknown transport type '{}'", value))?;
                }
                "adrfam" => trid.adrfam = Some(value.to_string()),
                "traddr" => trid.traddr = value.to_string(),
                "trsvcid" => trid.trsvcid = Some(value.to_string()),
                "subnqn" => trid.subnqn = value.to_string(),
                "ns" => {
                    let nsid: u32 = value
                        .parse()
                        .map_err(|_| "NVMe namespace IDs must be numeric".to_string())?;
                    if nsid == 0 || nsid > 65535 {
                        return Err(
                            "NVMe namespace IDs must be less than 65536 and greater than 0"
                                .to_string(),
                        );
                    }
                    trid.nsid = Some(nsid as u16);
                }
                "hostnqn" => trid.hostnqn = Some(value.to_string()),
                "size" => {
                    trid.size_bytes = parse_capacity(value)
                        .ok_or_else(|| format!("Invalid capacity '{}'", value))?;
                }
                other => return Err(format!("Unknown transport ID key '{}'", other)),
            }
        }
        Ok(trid)
    }

    /// Display name in the attach-log style.
    pub fn display_name(&self) -> String {
        match self.trtype {
            TrType::Pcie => format!("PCIE ({})", self.traddr),
            TrType::Mem => format!("Mem ({})", self.traddr),
            TrType::Rdma | TrType::Tcp => format!(
                "{} (addr:{} subnqn:{})",
                self.trtype.name(),
                self.traddr,
                self.subnqn
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pcie() {
        let trid = TransportId::parse("trtype:PCIe traddr:0000:04:00.0").unwrap();
        assert_eq!(trid.trtype, TrType::Pcie);
        assert_eq!(trid.traddr, "0000:04:00.0");
        assert_eq!(trid.subnqn, DISCOVERY_NQN);
        assert_eq!(trid.nsid, None);
    }

    #[test]
    fn test_parse_rdma_full() {
        let trid = TransportId::parse(
            "trtype:RDMA adrfam:IPv4 traddr:192.168.100.8 trsvcid:4420 ns:3 hostnqn:nqn.host",
        )
        .unwrap();
        assert_eq!(trid.trtype, TrType::Rdma);
        assert_eq!(trid.adrfam.as_deref(), Some("IPv4"));
        assert_eq!(trid.trsvcid.as_deref(), Some("4420"));
        assert_eq!(trid.nsid, Some(3));
        assert_eq!(trid.hostnqn.as_deref(), Some("nqn.host"));
    }

    #[test]
    fn test_parse_mem_with_size() {
        let trid = TransportId::parse("trtype:Mem traddr:ram0 size:64M").unwrap();
        assert_eq!(trid.trtype, TrType::Mem);
        assert_eq!(trid.size_bytes, 64 << 20);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(TransportId::parse("trtype PCIe").is_err());
        assert!(TransportId::parse("trtype:floppy").is_err());
        assert!(TransportId::parse("ns:0").is_err());
        assert!(TransportId::parse("ns:70000").is_err());
        assert!(TransportId::parse("bogus:1").is_err());
    }
}
