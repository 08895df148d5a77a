//! Configuration (spec.md §6 "CLI" and "Persistent state"). A TOML config
//! file supplies defaults exactly as `turn-server/src/config.rs` does for
//! its `Turn`/`Controller`/`Hooks`/`Log` sections; the legacy key/value
//! persistent state file (`proto::state_file`) and a handful of CLI flags
//! layer on top of it, in that order, matching
//! `original_source/main.c`'s precedence (state file loaded first,
//! command-line options override it).

use std::{fs::read_to_string, net::SocketAddr, path::PathBuf};

use clap::Parser;
use serde::Deserialize;

use proto::state_file::StateFile;

#[derive(Deserialize, Debug, Clone)]
pub struct Network {
    /// Multicast group:port the tuner daemon sends RTP I/Q packets to.
    #[serde(default = "Network::input_group")]
    pub input_group: SocketAddr,

    /// Multicast group:port this receiver emits PCM audio to. The status
    /// stream uses `output_group.port() + 2`, RTCP uses `+ 1` (spec.md §6
    /// "Output wire formats").
    #[serde(default = "Network::output_group")]
    pub output_group: SocketAddr,

    /// Multicast TTL on every socket this process sends from.
    #[serde(default = "Network::ttl")]
    pub ttl: u32,
}

impl Network {
    fn input_group() -> SocketAddr {
        "239.1.2.1:5004".parse().unwrap()
    }

    fn output_group() -> SocketAddr {
        "239.2.2.1:5004".parse().unwrap()
    }

    fn ttl() -> u32 {
        1
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            input_group: Self::input_group(),
            output_group: Self::output_group(),
            ttl: Self::ttl(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct FilterConfig {
    /// Overlap-save input block size `L` (spec.md §3 "Pre-detection filter").
    #[serde(default = "FilterConfig::blocksize")]
    pub blocksize: usize,

    /// Impulse response length `M`.
    #[serde(default = "FilterConfig::impulse_len")]
    pub impulse_len: usize,

    /// Kaiser window shape parameter; 0 = rectangular.
    #[serde(default = "FilterConfig::kaiser_beta")]
    pub kaiser_beta: f32,

    /// Custom passband low edge, Hz, overriding the active mode's own
    /// default (spec.md §6 "Filter low"). `None` defers to the mode table.
    #[serde(default)]
    pub low_hz: Option<f32>,

    /// Custom passband high edge, Hz, overriding the active mode's own
    /// default (spec.md §6 "Filter high").
    #[serde(default)]
    pub high_hz: Option<f32>,
}

impl FilterConfig {
    fn blocksize() -> usize {
        3840
    }

    fn impulse_len() -> usize {
        4001
    }

    fn kaiser_beta() -> f32 {
        3.0
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocksize: Self::blocksize(),
            impulse_len: Self::impulse_len(),
            kaiser_beta: Self::kaiser_beta(),
            low_hz: None,
            high_hz: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Demod {
    /// Initial receiver (mode table) mode, e.g. "usb", "am", "fm".
    #[serde(default = "Demod::mode")]
    pub mode: String,

    /// Initial receiver frequency in Hz.
    #[serde(default = "Demod::frequency_hz")]
    pub frequency_hz: f64,

    /// Post-detection audio shift, Hz (mainly for CW).
    #[serde(default)]
    pub shift_hz: f64,

    /// Linear-demod PLL/Costas loop bandwidth, Hz.
    #[serde(default = "Demod::loop_bw_hz")]
    pub loop_bw_hz: f32,

    /// Step size for a future up/down tuning control, Hz (spec.md §6
    /// "Tunestep"). Carried through for state-file round-tripping even
    /// though no command currently consumes it.
    #[serde(default = "Demod::tunestep_hz")]
    pub tunestep_hz: f64,
}

impl Demod {
    fn mode() -> String {
        "usb".to_string()
    }

    fn frequency_hz() -> f64 {
        146_000_000.0
    }

    fn loop_bw_hz() -> f32 {
        50.0
    }

    fn tunestep_hz() -> f64 {
        1000.0
    }
}

impl Default for Demod {
    fn default() -> Self {
        Self {
            mode: Self::mode(),
            frequency_hz: Self::frequency_hz(),
            shift_hz: 0.0,
            loop_bw_hz: Self::loop_bw_hz(),
            tunestep_hz: Self::tunestep_hz(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Doppler {
    /// Shell command whose stdout lines carry Doppler corrections (spec.md
    /// §5 "Doppler tracker", out of scope beyond consuming its output).
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub demod: Demod,
    #[serde(default)]
    pub doppler: Doppler,
    #[serde(default)]
    pub log: Log,

    /// Output stream SSRC; a random value is chosen at startup if unset.
    #[serde(default)]
    pub output_ssrc: Option<u32>,

    /// Status publisher interval, milliseconds (spec.md §4.8: "every
    /// 100 ms"; overridable as the CLI's "update interval").
    #[serde(default = "Config::update_interval_ms")]
    pub update_interval_ms: u64,

    /// Path to the legacy key/value persistent state file (spec.md §6),
    /// loaded at startup and rewritten on clean shutdown.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Locale name for number/unit formatting (spec.md §6 "Locale"),
    /// round-tripped through the persistent state file only; this
    /// receiver does not otherwise localize its output.
    #[serde(default)]
    pub locale: Option<String>,
}

impl Config {
    fn update_interval_ms() -> u64 {
        100
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            filter: FilterConfig::default(),
            demod: Demod::default(),
            doppler: Doppler::default(),
            log: Log::default(),
            output_ssrc: None,
            update_interval_ms: Self::update_interval_ms(),
            state_file: None,
            locale: None,
        }
    }
}

/// Command-line overrides (spec.md §6 "CLI"). Any flag present here wins
/// over both the TOML config file and the persistent state file, matching
/// `original_source/main.c`'s `getopt` precedence.
#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// TOML configuration file path.
    #[arg(long)]
    config: Option<String>,

    /// Legacy key/value persistent state file path.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Multicast group:port to receive RTP I/Q data from.
    #[arg(short = 'I', long)]
    input_group: Option<SocketAddr>,

    /// Multicast group:port to send PCM/status/RTCP to.
    #[arg(short = 'R', long)]
    output_group: Option<SocketAddr>,

    /// Initial receiver mode (am, fm, usb, lsb, cwu, cwl, iq, am-sync).
    #[arg(short = 'm', long)]
    mode: Option<String>,

    /// Initial center frequency in Hz.
    #[arg(short = 'f', long)]
    frequency: Option<f64>,

    /// Pre-detection filter block size (L).
    #[arg(short = 'L', long)]
    blocksize: Option<usize>,

    /// Pre-detection filter impulse response length (M).
    #[arg(short = 'M', long)]
    impulse_len: Option<usize>,

    /// Kaiser window shape parameter.
    #[arg(short = 'k', long)]
    kaiser_beta: Option<f32>,

    /// Shell command whose stdout carries Doppler corrections.
    #[arg(long)]
    doppler_command: Option<String>,

    /// Output stream SSRC.
    #[arg(short = 'S', long)]
    ssrc: Option<u32>,

    /// Multicast TTL on emitted packets.
    #[arg(short = 'T', long)]
    ttl: Option<u32>,

    /// Status publisher update interval, milliseconds.
    #[arg(short = 'u', long)]
    update_interval_ms: Option<u64>,
}

impl Config {
    /// Loads the TOML config file (if any), merges the legacy persistent
    /// state file on top, then applies CLI overrides, matching the
    /// teacher's `Config::load` shape extended with the extra layer spec.md
    /// §6 requires.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();

        let cfg_str = cli
            .config
            .as_ref()
            .and_then(|path| read_to_string(path).ok())
            .unwrap_or_default();
        let mut config: Config = toml::from_str(&cfg_str)?;

        let state_path = cli.state_file.clone().or_else(|| config.state_file.clone());
        if let Some(path) = &state_path {
            if let Ok(text) = read_to_string(path) {
                config.apply_state_file(&StateFile::parse(&text));
            }
            config.state_file = Some(path.clone());
        }

        config.apply_cli(cli);
        Ok(config)
    }

    fn apply_state_file(&mut self, state: &StateFile) {
        if let Some(freq) = state.get_f64("Frequency") {
            self.demod.frequency_hz = freq;
        }
        if let Some(mode) = state.get("Mode") {
            self.demod.mode = mode.to_string();
        }
        if let Some(shift) = state.get_f64("Shift") {
            self.demod.shift_hz = shift;
        }
        if let Some(low) = state.get_f64("Filter low") {
            self.filter.low_hz = Some(low as f32);
        }
        if let Some(high) = state.get_f64("Filter high") {
            self.filter.high_hz = Some(high as f32);
        }
        if let Some(beta) = state.get_f64("Kaiser Beta") {
            self.filter.kaiser_beta = beta as f32;
        }
        if let Some(blocksize) = state.get_u32("Blocksize") {
            self.filter.blocksize = blocksize as usize;
        }
        if let Some(impulse_len) = state.get_u32("Impulse len") {
            self.filter.impulse_len = impulse_len as usize;
        }
        if let Some(tunestep) = state.get_f64("Tunestep") {
            self.demod.tunestep_hz = tunestep;
        }
        if let Some(ttl) = state.get_u32("TTL") {
            self.network.ttl = ttl;
        }
        if let Some(Ok(addr)) = state.get("Source").map(|s| s.parse()) {
            self.network.input_group = addr;
        }
        if let Some(Ok(addr)) = state.get("Output").map(|s| s.parse()) {
            self.network.output_group = addr;
        }
        if let Some(locale) = state.get("Locale") {
            self.locale = Some(locale.to_string());
        }
    }

    fn apply_cli(&mut self, cli: Cli) {
        if let Some(v) = cli.input_group {
            self.network.input_group = v;
        }
        if let Some(v) = cli.output_group {
            self.network.output_group = v;
        }
        if let Some(v) = cli.mode {
            self.demod.mode = v;
        }
        if let Some(v) = cli.frequency {
            self.demod.frequency_hz = v;
        }
        if let Some(v) = cli.blocksize {
            self.filter.blocksize = v;
        }
        if let Some(v) = cli.impulse_len {
            self.filter.impulse_len = v;
        }
        if let Some(v) = cli.kaiser_beta {
            self.filter.kaiser_beta = v;
        }
        if let Some(v) = cli.doppler_command {
            self.doppler.command = Some(v);
        }
        if let Some(v) = cli.ssrc {
            self.output_ssrc = Some(v);
        }
        if let Some(v) = cli.ttl {
            self.network.ttl = v;
        }
        if let Some(v) = cli.update_interval_ms {
            self.update_interval_ms = v;
        }
    }

    /// Derives the status-stream socket from the output group (spec.md §6:
    /// "port+2").
    pub fn status_addr(&self) -> SocketAddr {
        let mut addr = self.network.output_group;
        addr.set_port(addr.port() + 2);
        addr
    }

    /// Derives the RTCP socket from the output group (spec.md §6: "port+1").
    pub fn rtcp_addr(&self) -> SocketAddr {
        let mut addr = self.network.output_group;
        addr.set_port(addr.port() + 1);
        addr
    }

    /// Derives the tuner-command socket from the input group (spec.md §6:
    /// "input-group port+1").
    pub fn tuner_command_addr(&self) -> SocketAddr {
        let mut addr = self.network.input_group;
        addr.set_port(addr.port() + 1);
        addr
    }

    /// Serializes the parts of the receiver's current state the spec names
    /// for the persistent state file back to `Key value` lines.
    pub fn to_state_file(&self) -> StateFile {
        let mut state = StateFile::default();
        state.set("Frequency", self.demod.frequency_hz.to_string());
        state.set("Mode", self.demod.mode.clone());
        state.set("Shift", self.demod.shift_hz.to_string());
        if let Some(low) = self.filter.low_hz {
            state.set("Filter low", low.to_string());
        }
        if let Some(high) = self.filter.high_hz {
            state.set("Filter high", high.to_string());
        }
        state.set("Kaiser Beta", self.filter.kaiser_beta.to_string());
        state.set("Blocksize", self.filter.blocksize.to_string());
        state.set("Impulse len", self.filter.impulse_len.to_string());
        state.set("Tunestep", self.demod.tunestep_hz.to_string());
        state.set("Source", self.network.input_group.to_string());
        state.set("Output", self.network.output_group.to_string());
        state.set("TTL", self.network.ttl.to_string());
        if let Some(locale) = &self.locale {
            state.set("Locale", locale.clone());
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_derives_expected_ports() {
        let config = Config::default();
        assert_eq!(config.status_addr().port(), config.network.output_group.port() + 2);
        assert_eq!(config.rtcp_addr().port(), config.network.output_group.port() + 1);
        assert_eq!(
            config.tuner_command_addr().port(),
            config.network.input_group.port() + 1
        );
    }

    #[test]
    fn state_file_round_trips_through_apply() {
        let mut config = Config::default();
        let text = config.to_state_file().to_text();
        let state = StateFile::parse(&text);
        config.demod.mode = "changed".to_string();
        config.apply_state_file(&state);
        assert_eq!(config.demod.mode, "usb");
    }

    #[test]
    fn filter_edges_tunestep_and_locale_survive_round_trip() {
        let mut config = Config::default();
        config.filter.low_hz = Some(-2700.0);
        config.filter.high_hz = Some(2700.0);
        config.demod.tunestep_hz = 500.0;
        config.locale = Some("en_US.UTF-8".to_string());

        let text = config.to_state_file().to_text();
        let state = StateFile::parse(&text);

        let mut reloaded = Config::default();
        reloaded.apply_state_file(&state);

        assert_eq!(reloaded.filter.low_hz, Some(-2700.0));
        assert_eq!(reloaded.filter.high_hz, Some(2700.0));
        assert_eq!(reloaded.demod.tunestep_hz, 500.0);
        assert_eq!(reloaded.locale, Some("en_US.UTF-8".to_string()));
    }
}
