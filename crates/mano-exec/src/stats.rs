//! Parsers for kernel networking statistics.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::validate::{ExecError, ExecResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounters {
    pub bytes: u64,
    pub packets: u64,
    pub errors: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub name: String,
    pub up: bool,
    pub mtu: Option<u32>,
    pub rx: LinkCounters,
    pub tx: LinkCounters,
}

fn parse_counters(line: &str) -> Option<LinkCounters> {
    let mut fields = line.split_whitespace().filter_map(|f| f.parse::<u64>().ok());
    Some(LinkCounters {
        bytes: fields.next()?,
        packets: fields.next()?,
        errors: fields.next()?,
        dropped: fields.next()?,
    })
}

/// Parse the output of `ip -s link show dev <name>`.
pub fn parse_link_stats(output: &str) -> ExecResult<InterfaceStats> {
    let mut lines = output.lines();
    let header = lines.next().ok_or_else(|| ExecError::ParseFailed {
        what: "ip -s link".to_string(),
        detail: "empty output".to_string(),
    })?;

    // "2: vxlan100@eth0: <BROADCAST,...,UP,LOWER_UP> mtu 1450 qdisc ..."
    let mut parts = header.split_whitespace();
    let _index = parts.next();
    let raw_name = parts.next().ok_or_else(|| ExecError::ParseFailed {
        what: "ip -s link".to_string(),
        detail: "missing interface name".to_string(),
    })?;
    let name = raw_name
        .trim_end_matches(':')
        .split('@')
        .next()
        .unwrap_or(raw_name)
        .to_string();

    let up = header.contains(",UP") || header.contains("<UP") || header.contains("state UP");
    let mtu = header
        .split_whitespace()
        .skip_while(|t| *t != "mtu")
        .nth(1)
        .and_then(|t| t.parse::<u32>().ok());

    let mut rx = None;
    let mut tx = None;
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("RX:") {
            if let Some(data) = lines.next() {
                rx = parse_counters(data);
            }
        } else if trimmed.starts_with("TX:") {
            if let Some(data) = lines.next() {
                tx = parse_counters(data);
            }
        }
    }

    match (rx, tx) {
        (Some(rx), Some(tx)) => Ok(InterfaceStats {
            name,
            up,
            mtu,
            rx,
            tx,
        }),
        _ => Err(ExecError::ParseFailed {
            what: "ip -s link".to_string(),
            detail: "missing RX/TX counter block".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QdiscStats {
    pub kind: String,
    pub handle: String,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub dropped: u64,
    pub overlimits: u64,
}

/// Parse the output of `tc -s qdisc show dev <name>`.
pub fn parse_qdisc_stats(output: &str) -> Vec<QdiscStats> {
    let mut stats: Vec<QdiscStats> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("qdisc ") {
            let mut parts = trimmed.split_whitespace();
            let _ = parts.next();
            let kind = parts.next().unwrap_or_default().to_string();
            let handle = parts.next().unwrap_or_default().to_string();
            stats.push(QdiscStats {
                kind,
                handle,
                ..QdiscStats::default()
            });
        } else if trimmed.starts_with("Sent ") {
            if let Some(current) = stats.last_mut() {
                // "Sent 12345 bytes 100 pkt (dropped 2, overlimits 5 requeues 0)"
                let tokens: Vec<&str> = trimmed
                    .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',')
                    .filter(|t| !t.is_empty())
                    .collect();
                for window in tokens.windows(2) {
                    match window[0] {
                        "Sent" => current.sent_bytes = window[1].parse().unwrap_or(0),
                        "bytes" => current.sent_packets = window[1].parse().unwrap_or(0),
                        "dropped" => current.dropped = window[1].parse().unwrap_or(0),
                        "overlimits" => current.overlimits = window[1].parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
        }
    }
    stats
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdbEntry {
    pub mac: String,
    pub dst: Option<IpAddr>,
}

/// Parse `bridge fdb show dev <device>` output into entries.
pub fn parse_fdb(output: &str) -> Vec<FdbEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let mac = tokens.next()?.to_string();
            if mac.len() != 17 || !mac.contains(':') {
                return None;
            }
            let mut dst = None;
            let tokens: Vec<&str> = tokens.collect();
            for pair in tokens.windows(2) {
                if pair[0] == "dst" {
                    dst = pair[1].parse::<IpAddr>().ok();
                }
            }
            Some(FdbEntry { mac, dst })
        })
        .collect()
}

/// Interface names from `ip -d link show type vxlan` output.
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let index = parts.next()?;
            if !index.ends_with(':') || index.trim_end_matches(':').parse::<u32>().is_err() {
                return None;
            }
            let raw = parts.next()?;
            Some(
                raw.trim_end_matches(':')
                    .split('@')
                    .next()
                    .unwrap_or(raw)
                    .to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_S_LINK: &str = "\
4: vxlan100@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000
    link/ether 2a:4f:00:11:22:33 brd ff:ff:ff:ff:ff:ff
    RX: bytes  packets  errors  dropped overrun mcast
    123456     789      1       2       0       0
    TX: bytes  packets  errors  dropped carrier collsns
    654321     987      0       3       0       0";

    #[test]
    fn parses_interface_counters() {
        let stats = parse_link_stats(IP_S_LINK).unwrap();
        assert_eq!(stats.name, "vxlan100");
        assert!(stats.up);
        assert_eq!(stats.mtu, Some(1450));
        assert_eq!(stats.rx.bytes, 123456);
        assert_eq!(stats.rx.errors, 1);
        assert_eq!(stats.tx.packets, 987);
        assert_eq!(stats.tx.dropped, 3);
    }

    #[test]
    fn parse_rejects_truncated_output() {
        assert!(parse_link_stats("4: eth0: <UP> mtu 1500").is_err());
        assert!(parse_link_stats("").is_err());
    }

    #[test]
    fn parses_qdisc_statistics() {
        let output = "\
qdisc htb 1: root refcnt 2 r2q 10 default 0x3e7 direct_packets_stat 0
 Sent 12345 bytes 100 pkt (dropped 2, overlimits 5 requeues 0)
 backlog 0b 0p requeues 0
qdisc netem 110: parent 1:11 limit 1000 delay 8ms
 Sent 999 bytes 9 pkt (dropped 0, overlimits 0 requeues 0)";
        let stats = parse_qdisc_stats(output);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].kind, "htb");
        assert_eq!(stats[0].handle, "1:");
        assert_eq!(stats[0].sent_bytes, 12345);
        assert_eq!(stats[0].sent_packets, 100);
        assert_eq!(stats[0].dropped, 2);
        assert_eq!(stats[0].overlimits, 5);
        assert_eq!(stats[1].kind, "netem");
        assert_eq!(stats[1].sent_bytes, 999);
    }

    #[test]
    fn parses_fdb_entries() {
        let output = "\
00:00:00:00:00:00 dev vxlan100 dst 10.0.1.2 self permanent
00:00:00:00:00:00 dev vxlan100 dst 10.0.1.3 self permanent
2a:4f:00:11:22:33 dev vxlan100 master br0";
        let entries = parse_fdb(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].dst, Some("10.0.1.2".parse().unwrap()));
        assert_eq!(entries[2].dst, None);
    }

    #[test]
    fn parses_vxlan_device_names() {
        let output = "\
5: vxlan100@NONE: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue
    link/ether aa:bb:cc:dd:ee:ff brd ff:ff:ff:ff:ff:ff
7: vxlan200: <BROADCAST,MULTICAST> mtu 1450 qdisc noop
    link/ether aa:bb:cc:dd:ee:00 brd ff:ff:ff:ff:ff:ff";
        assert_eq!(parse_link_names(output), vec!["vxlan100", "vxlan200"]);
    }
}
