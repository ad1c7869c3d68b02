use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::net::error::{NetError, NetResult};
use crate::net::link::LinkManager;
use crate::utils::command::CommandExecutor;

/// How long every prober is allowed to collect samples before the batch is
/// reaped, regardless of outcome.
const MEASURE_WINDOW: Duration = Duration::from_secs(10);

const TRIM_RATIO: f64 = 0.1;

/// Concurrent link-liveness measurement over /30 point-to-point interfaces.
///
/// One long-running `ping` child per interface; all children are killed when
/// the window expires, on every exit path.
pub struct PingAggregator {
    netns: String,
}

struct Prober {
    ifname: String,
    child: Child,
    reader: tokio::task::JoinHandle<Vec<f64>>,
}

impl PingAggregator {
    pub fn new(netns: &str) -> Self {
        Self {
            netns: netns.to_string(),
        }
    }

    /// Measure round-trip time to the /30 peer of each named interface.
    /// Interfaces that cannot be probed (missing, unaddressed, spawn failure)
    /// map to `None`; one bad interface never aborts the batch.
    pub async fn measure(
        &self,
        link: &LinkManager,
        ifnames: &[String],
    ) -> HashMap<String, Option<f64>> {
        let mut results: HashMap<String, Option<f64>> = HashMap::new();
        let mut probers: Vec<Prober> = Vec::new();

        for ifname in ifnames {
            results.insert(ifname.clone(), None);
            match self.spawn_prober(link, ifname).await {
                Ok(prober) => probers.push(prober),
                Err(e) => {
                    tracing::warn!(ifname = %ifname, "ping prober not started: {}", e);
                }
            }
        }

        if probers.is_empty() {
            return results;
        }

        tokio::time::sleep(MEASURE_WINDOW).await;

        for mut prober in probers {
            if let Err(e) = prober.child.kill().await {
                tracing::debug!(ifname = %prober.ifname, "prober kill: {}", e);
            }
            let samples = prober.reader.await.unwrap_or_default();
            tracing::debug!(
                ifname = %prober.ifname,
                samples = samples.len(),
                "ping window closed"
            );
            results.insert(prober.ifname, trimmed_mean(&samples));
        }

        results
    }

    async fn spawn_prober(&self, link: &LinkManager, ifname: &str) -> NetResult<Prober> {
        let state = link
            .get_interface_state(ifname)
            .await?
            .ok_or_else(|| NetError::NotFound(format!("interface {}", ifname)))?;
        let net = state
            .ipv4
            .ok_or_else(|| NetError::NotFound(format!("no ipv4 address on {}", ifname)))?;
        let peer = link_peer_addr(net)?;

        // -D timestamps each reply, -n skips DNS, -r forces the direct route.
        let argv = CommandExecutor::sudo_wrap(CommandExecutor::ns_wrap(
            &self.netns,
            crate::utils::command::argv(&[
                "ping",
                "-D",
                "-n",
                "-i",
                "1",
                "-r",
                &peer.to_string(),
            ]),
        ));

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| NetError::Validation("empty prober argv".to_string()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(NetError::Io)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            NetError::Validation("ping child has no stdout pipe".to_string())
        })?;
        let reader = tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(ms) = parse_ping_line(&line) {
                    samples.push(ms);
                }
            }
            samples
        });

        Ok(Prober {
            ifname: ifname.to_string(),
            child,
            reader,
        })
    }
}

/// The /30 peer of an addressed interface: network+1 and network+2 are the
/// only usable hosts, so the peer is whichever one we are not.
pub fn link_peer_addr(net: Ipv4Net) -> NetResult<Ipv4Addr> {
    if net.prefix_len() != 30 {
        return Err(NetError::Validation(format!(
            "link network {} is not a /30",
            net
        )));
    }
    let base = u32::from(net.network());
    let local = u32::from(net.addr());
    if local == base + 1 {
        Ok(Ipv4Addr::from(base + 2))
    } else {
        Ok(Ipv4Addr::from(base + 1))
    }
}

/// Parse one timestamped ping reply line, e.g.
/// `[1700000000.123456] 64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=27.3 ms`.
pub fn parse_ping_line(line: &str) -> Option<f64> {
    if !line.starts_with('[') {
        return None;
    }
    let after = line.split_once("time=")?.1;
    let value = after.split_whitespace().next()?;
    value.parse().ok()
}

/// Trimmed mean: drop `floor(n * 0.1)` samples from each tail; an empty
/// trimmed set falls back to the plain mean, no samples at all is `None`.
pub fn trimmed_mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let trim = (sorted.len() as f64 * TRIM_RATIO).floor() as usize;
    let trimmed = &sorted[trim..sorted.len() - trim];
    let set = if trimmed.is_empty() {
        &sorted[..]
    } else {
        trimmed
    };
    Some(set.iter().sum::<f64>() / set.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_mean_drops_one_outlier_per_tail_at_ten_samples() {
        let samples = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 100.0];
        assert_eq!(trimmed_mean(&samples), Some(1.0));
    }

    #[test]
    fn small_sample_sets_use_the_plain_mean() {
        assert_eq!(trimmed_mean(&[4.0]), Some(4.0));
        assert_eq!(trimmed_mean(&[2.0, 6.0]), Some(4.0));
        assert_eq!(trimmed_mean(&[]), None);
    }

    #[test]
    fn ping_line_parse_requires_timestamp_prefix() {
        let line = "[1700000000.123456] 64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=27.3 ms";
        assert_eq!(parse_ping_line(line), Some(27.3));
        assert_eq!(
            parse_ping_line("64 bytes from 10.0.0.2: icmp_seq=1 time=27.3 ms"),
            None
        );
        assert_eq!(parse_ping_line("[1700000000.1] something else"), None);
    }

    #[test]
    fn peer_address_is_the_complement_host() {
        let one: Ipv4Net = "10.0.0.1/30".parse().unwrap();
        let two: Ipv4Net = "10.0.0.2/30".parse().unwrap();
        assert_eq!(link_peer_addr(one).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(link_peer_addr(two).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        let wide: Ipv4Net = "10.0.0.1/24".parse().unwrap();
        assert!(link_peer_addr(wide).is_err());
    }
}
