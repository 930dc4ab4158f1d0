use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tsmemseg")]
#[command(about = "In-memory TS segmenter for HLS, publishing through named pipes / FIFOs")]
#[command(disable_help_flag = true)]
pub struct Cli {
    /// Print help
    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Package segments as fragmented MP4 instead of raw TS
    #[arg(short = '4')]
    pub mp4: bool,

    /// Target duration of the first segment in seconds (0-60)
    #[arg(short = 'i', value_name = "init_duration", default_value_t = 1.0)]
    pub init_duration: f64,

    /// Target segment duration in seconds (0-60)
    #[arg(short = 't', value_name = "target_duration", default_value_t = 2.0)]
    pub target_duration: f64,

    /// Target partial-segment duration in seconds (0-60); 0 disables partials
    #[arg(short = 'p', value_name = "partial_target", default_value_t = 0.5)]
    pub partial_duration: f64,

    /// Stop when no reader accesses any endpoint for this many seconds (0-600)
    #[arg(short = 'a', value_name = "access_timeout", default_value_t = 10.0)]
    pub access_timeout: f64,

    /// Command to run through the shell when closing
    #[arg(short = 'c', value_name = "closing_command")]
    pub closing_command: Option<String>,

    /// Read-rate limit in percent of real time (0, or 20-500)
    #[arg(short = 'r', value_name = "read_rate", default_value_t = 0.0)]
    pub read_rate: f64,

    /// Read rate while filling the ring, percent (0, or 20-750); default 1.5x read rate
    #[arg(short = 'f', value_name = "fill_read_rate")]
    pub fill_read_rate: Option<f64>,

    /// Number of segment slots (2-99)
    #[arg(short = 's', value_name = "seg_num", default_value_t = 8)]
    pub segment_count: usize,

    /// Size ceiling of one segment in kbytes (32-32768)
    #[arg(short = 'm', value_name = "max_kbytes", default_value_t = 4096)]
    pub max_kbytes: usize,

    /// Directory for the FIFOs (Unix)
    #[arg(short = 'g', value_name = "fifo_dir", default_value = ".")]
    pub fifo_dir: PathBuf,

    /// ARIB caption conversion flags passed to the packet filter (0, 1 or 3)
    #[arg(short = 'd', value_name = "flags", default_value_t = 0)]
    pub arib_flags: u32,

    /// Stream name ([0-9A-Za-z_], at most 65 chars), or '-' for stdout passthrough
    #[arg(value_name = "seg_name")]
    pub seg_name: String,
}

impl Cli {
    /// Range checks beyond what clap's types give us. Returns a message
    /// for the first invalid argument.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=60.0).contains(&self.init_duration) {
            return Err("init_duration must be 0-60 seconds".into());
        }
        if !(0.0..=60.0).contains(&self.target_duration) {
            return Err("target_duration must be 0-60 seconds".into());
        }
        if !(0.0..=60.0).contains(&self.partial_duration) {
            return Err("partial_target must be 0-60 seconds".into());
        }
        if !(0.0..=600.0).contains(&self.access_timeout) {
            return Err("access_timeout must be 0-600 seconds".into());
        }
        if self.read_rate != 0.0 && !(20.0..=500.0).contains(&self.read_rate) {
            return Err("read_rate must be 0 or 20-500 percent".into());
        }
        if let Some(fill) = self.fill_read_rate {
            if fill != 0.0 && !(20.0..=750.0).contains(&fill) {
                return Err("fill_read_rate must be 0 or 20-750 percent".into());
            }
        }
        if !(2..=99).contains(&self.segment_count) {
            return Err("seg_num must be 2-99".into());
        }
        if !(32..=32768).contains(&self.max_kbytes) {
            return Err("max_kbytes must be 32-32768".into());
        }
        if !matches!(self.arib_flags, 0 | 1 | 3) {
            return Err("flags must be 0, 1 or 3".into());
        }
        if self.seg_name != "-" && !valid_seg_name(&self.seg_name) {
            return Err("seg_name must be 1-65 chars of [0-9A-Za-z_]".into());
        }
        Ok(())
    }

    /// Steady read rate in per-mille.
    pub fn read_rate_per_mille(&self) -> u32 {
        (self.read_rate * 10.0) as u32
    }

    /// Fill-phase read rate in per-mille; defaults to 1.5x the steady
    /// rate.
    pub fn fill_read_rate_per_mille(&self) -> u32 {
        match self.fill_read_rate {
            Some(fill) => (fill * 10.0) as u32,
            None => self.read_rate_per_mille() * 3 / 2,
        }
    }
}

fn valid_seg_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 65
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tsmemseg").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["live1"]);
        assert!(!cli.mp4);
        assert_eq!(cli.target_duration, 2.0);
        assert_eq!(cli.partial_duration, 0.5);
        assert_eq!(cli.segment_count, 8);
        assert_eq!(cli.max_kbytes, 4096);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_mp4_short_flag() {
        let cli = parse(&["-4", "-t", "2", "-p", "0.5", "-s", "4", "live1"]);
        assert!(cli.mp4);
        assert_eq!(cli.segment_count, 4);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_fill_rate_defaults_to_1_5x() {
        let cli = parse(&["-r", "100", "live1"]);
        assert_eq!(cli.read_rate_per_mille(), 1000);
        assert_eq!(cli.fill_read_rate_per_mille(), 1500);
        let cli = parse(&["-r", "100", "-f", "120", "live1"]);
        assert_eq!(cli.fill_read_rate_per_mille(), 1200);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        assert!(parse(&["-t", "61", "live1"]).validate().is_err());
        assert!(parse(&["-r", "10", "live1"]).validate().is_err());
        assert!(parse(&["-s", "1", "live1"]).validate().is_err());
        assert!(parse(&["-m", "16", "live1"]).validate().is_err());
        assert!(parse(&["-d", "2", "live1"]).validate().is_err());
        assert!(parse(&["bad name"]).validate().is_err());
        let long = "x".repeat(66);
        assert!(parse(&[long.as_str()]).validate().is_err());
    }

    #[test]
    fn test_passthrough_name() {
        assert!(parse(&["-"]).validate().is_ok());
    }
}
