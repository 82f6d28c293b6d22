#[cfg(feature = "quic")]
use std::{net::SocketAddr, time::Duration};

use typed_builder::TypedBuilder;

#[cfg(feature = "quic")]
use crate::{Error, Rank};

/// Protocol options. Every rank of a run must use the same values, since
/// they decide which collectives follow each command.
#[derive(TypedBuilder, Clone, Debug, PartialEq, Eq)]
pub struct PmiConfig {
    /// Gather a status report from every rank after each command. Without
    /// it, failures on workers go unnoticed until the run hangs or produces
    /// wrong results. Off by default in `optimize` builds.
    #[builder(default = !cfg!(feature = "optimize"))]
    pub status_channel: bool,
}

impl Default for PmiConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(feature = "quic")]
pub const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:4710";

/// Where this process sits in a QUIC run.
#[cfg(feature = "quic")]
#[derive(TypedBuilder, Clone, Debug)]
pub struct QuicConfig {
    pub rank: Rank,
    /// Number of ranks, controller included.
    pub size: usize,
    /// The controller listens here and workers dial it.
    pub controller_addr: SocketAddr,
    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub keep_alive_interval: Duration,
}

#[cfg(feature = "quic")]
impl QuicConfig {
    /// Reads `PMI_RANK`, `PMI_SIZE` and `PMI_CONTROLLER` (defaults to
    /// `127.0.0.1:4710`), the way a launcher hands out ranks.
    pub fn from_env() -> Result<Self, Error> {
        let rank = parse_var::<Rank>("PMI_RANK")?;
        let size = parse_var::<usize>("PMI_SIZE")?;
        let controller_addr = match std::env::var("PMI_CONTROLLER") {
            Ok(addr) => addr
                .parse()
                .map_err(|e| Error::Config(format!("PMI_CONTROLLER={addr}: {e}")))?,
            Err(_) => DEFAULT_CONTROLLER_ADDR
                .parse()
                .map_err(|e| Error::Config(format!("{e}")))?,
        };
        let config = QuicConfig::builder()
            .rank(rank)
            .size(size)
            .controller_addr(controller_addr)
            .build();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.size == 0 {
            return Err(Error::Config("a run needs at least one rank".into()));
        }
        if self.rank >= self.size {
            return Err(Error::Config(format!(
                "rank {} is out of range for {} ranks",
                self.rank, self.size
            )));
        }
        if self.size - 1 > u32::MAX as usize {
            return Err(Error::Config(format!("{} ranks is too many", self.size)));
        }
        Ok(())
    }
}

#[cfg(feature = "quic")]
fn parse_var<T>(name: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = std::env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))?;
    value
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_channel_default_follows_build_mode() {
        assert_eq!(
            PmiConfig::default().status_channel,
            !cfg!(feature = "optimize")
        );
        assert!(!PmiConfig::builder().status_channel(false).build().status_channel);
    }

    #[cfg(feature = "quic")]
    #[test]
    fn quic_config_rejects_rank_outside_run() {
        let config = QuicConfig::builder()
            .rank(4)
            .size(4)
            .controller_addr(DEFAULT_CONTROLLER_ADDR.parse().unwrap())
            .build();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }
}
