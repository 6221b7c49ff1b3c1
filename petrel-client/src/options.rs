//! Command-line options for the client core.
//!
//! Every flag takes the `--name=value` form; boolean flags take no value.
//! Unknown flags are an error so a misspelled cache knob cannot silently
//! fall back to defaults.

/// Timestamp style for the file log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStamp {
    None,
    Usec,
    Datetime,
}

/// Log sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    File,
    Syslog,
}

/// Per-cache tunables as given on the command line. `*_set` records whether
/// the operator supplied the value, which decides whether server-derived
/// values may override it later.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheOptions {
    pub timeout: u64,
    pub timeout_set: bool,
    pub soft_limit: u64,
    pub soft_limit_set: bool,
    pub hard_limit: u64,
    pub hard_limit_set: bool,
    pub reclaim_percentage: u64,
    pub reclaim_percentage_set: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Attribute cache, milliseconds.
    pub acache: CacheOptions,
    /// Name cache, milliseconds.
    pub ncache: CacheOptions,
    /// Credential cache, seconds.
    pub ccache: CacheOptions,
    /// Capability cache, seconds.
    pub capcache: CacheOptions,

    pub perf_time_interval_secs: u64,
    pub perf_history_size: u64,

    pub readahead_size: usize,
    pub readahead_count: usize,
    pub readahead_readcnt: i32,
    pub readahead_pinned: bool,

    pub logfile: String,
    pub logtype: LogType,
    pub logstamp: LogStamp,
    pub gossip_mask: String,

    /// I/O shared-buffer pool geometry.
    pub desc_count: usize,
    pub desc_size: usize,

    /// Running under a supervising parent; suppress core dumps.
    pub child: bool,
    pub events: Option<String>,
    pub keypath: Option<String>,
    /// Use the embedded single-node engine.
    pub standalone: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            acache: CacheOptions {
                timeout: 5000,
                ..Default::default()
            },
            ncache: CacheOptions {
                timeout: 5000,
                ..Default::default()
            },
            ccache: CacheOptions {
                timeout: 600,
                ..Default::default()
            },
            capcache: CacheOptions {
                timeout: 600,
                ..Default::default()
            },
            perf_time_interval_secs: 300,
            perf_history_size: 10,
            readahead_size: 65536,
            readahead_count: 8,
            readahead_readcnt: 4,
            readahead_pinned: false,
            logfile: String::from("/tmp/petrel-client.log"),
            logtype: LogType::File,
            logstamp: LogStamp::Usec,
            gossip_mask: String::from("none"),
            desc_count: 64,
            desc_size: 65536,
            child: false,
            events: None,
            keypath: None,
            standalone: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Unknown(String),
    BadValue(String),
    /// `--help` was given; the caller should print usage and exit 0.
    Help,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Unknown(flag) => write!(f, "unrecognized option: {flag}"),
            ParseError::BadValue(flag) => write!(f, "bad value for option: {flag}"),
            ParseError::Help => write!(f, "help requested"),
        }
    }
}

fn set_num(dst: &mut u64, flag_set: &mut bool, arg: &str, value: &str) -> Result<(), ParseError> {
    *dst = value
        .parse()
        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
    *flag_set = true;
    Ok(())
}

impl ClientOptions {
    /// Parse a full argument vector (excluding argv[0]).
    pub fn parse<I, S>(args: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            let (flag, value) = match arg.split_once('=') {
                Some((f, v)) => (f, v),
                None => (arg, ""),
            };
            match flag {
                "-h" | "--help" => return Err(ParseError::Help),
                "--child" => opts.child = true,
                "--standalone" => opts.standalone = true,
                "--readahead-pinned" => {
                    opts.readahead_pinned = value.is_empty() || value == "1";
                }
                "--logfile" => opts.logfile = value.to_string(),
                "--logtype" => {
                    opts.logtype = match value {
                        "file" => LogType::File,
                        "syslog" => LogType::Syslog,
                        _ => return Err(ParseError::BadValue(arg.to_string())),
                    }
                }
                "--logstamp" => {
                    opts.logstamp = match value {
                        "none" => LogStamp::None,
                        "usec" => LogStamp::Usec,
                        "datetime" => LogStamp::Datetime,
                        _ => return Err(ParseError::BadValue(arg.to_string())),
                    }
                }
                "--gossip-mask" => opts.gossip_mask = value.to_string(),
                "--events" => opts.events = Some(value.to_string()),
                "--keypath" => opts.keypath = Some(value.to_string()),
                "--readahead-size" => {
                    opts.readahead_size = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--readahead-count" => {
                    opts.readahead_count = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--readahead-readcnt" => {
                    opts.readahead_readcnt = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--desc-count" => {
                    opts.desc_count = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--desc-size" => {
                    opts.desc_size = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--perf-time-interval-secs" => {
                    opts.perf_time_interval_secs = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                "--perf-history-size" => {
                    opts.perf_history_size = value
                        .parse()
                        .map_err(|_| ParseError::BadValue(arg.to_string()))?;
                }
                _ => {
                    let (cache, param) = if let Some(p) = flag.strip_prefix("--acache-") {
                        (&mut opts.acache, p)
                    } else if let Some(p) = flag.strip_prefix("--ncache-") {
                        (&mut opts.ncache, p)
                    } else if let Some(p) = flag.strip_prefix("--ccache-") {
                        (&mut opts.ccache, p)
                    } else if let Some(p) = flag.strip_prefix("--capcache-") {
                        (&mut opts.capcache, p)
                    } else {
                        return Err(ParseError::Unknown(arg.to_string()));
                    };
                    match param {
                        "timeout" => {
                            set_num(&mut cache.timeout, &mut cache.timeout_set, arg, value)?
                        }
                        "soft-limit" => {
                            set_num(&mut cache.soft_limit, &mut cache.soft_limit_set, arg, value)?
                        }
                        "hard-limit" => {
                            set_num(&mut cache.hard_limit, &mut cache.hard_limit_set, arg, value)?
                        }
                        "reclaim-percentage" => set_num(
                            &mut cache.reclaim_percentage,
                            &mut cache.reclaim_percentage_set,
                            arg,
                            value,
                        )?,
                        _ => return Err(ParseError::Unknown(arg.to_string())),
                    }
                }
            }
        }
        Ok(opts)
    }

    /// Usage text for `--help`.
    pub fn help(progname: &str) -> String {
        format!(
            "Usage: {progname} [OPTION]...\n\n\
             -h, --help                    display this help and exit\n\
             --acache-timeout=MS           attribute cache timeout\n\
             --acache-soft-limit=N         attribute cache soft entry limit\n\
             --acache-hard-limit=N         attribute cache hard entry limit\n\
             --acache-reclaim-percentage=P attribute cache reclaim percentage\n\
             --ncache-*                    same four knobs for the name cache\n\
             --ccache-timeout=SECS         credential cache timeout\n\
             --ccache-*                    limits as above\n\
             --capcache-timeout=SECS       capability cache timeout\n\
             --capcache-*                  limits as above\n\
             --perf-time-interval-secs=S   perf counter rollover interval\n\
             --perf-history-size=N         perf counter history depth\n\
             --readahead-size=BYTES        readahead block size (0 disables)\n\
             --readahead-count=N           readahead block count (0 disables)\n\
             --readahead-readcnt=N         default speculative read count\n\
             --readahead-pinned            keep readahead blocks resident\n\
             --logfile=PATH                log file path\n\
             --logtype=file|syslog         log sink\n\
             --logstamp=none|usec|datetime log timestamp style\n\
             --gossip-mask=EVENTS          comma-separated debug subsystems\n\
             --desc-count=N                I/O buffer pool slice count\n\
             --desc-size=BYTES             I/O buffer pool slice size\n\
             --child                       running under a supervisor\n\
             --events=SPEC                 enable event tracing\n\
             --keypath=PATH                credential signing key\n\
             --standalone                  use the embedded single-node engine\n"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_arguments() {
        let opts = ClientOptions::parse(Vec::<String>::new()).unwrap();
        assert_eq!(opts.desc_count, 64);
        assert_eq!(opts.logtype, LogType::File);
        assert!(!opts.acache.timeout_set);
    }

    #[test]
    fn cache_family_flags_parse() {
        let opts = ClientOptions::parse([
            "--acache-timeout=250",
            "--ncache-soft-limit=100",
            "--ccache-hard-limit=12",
            "--capcache-reclaim-percentage=50",
        ])
        .unwrap();
        assert_eq!(opts.acache.timeout, 250);
        assert!(opts.acache.timeout_set);
        assert_eq!(opts.ncache.soft_limit, 100);
        assert!(opts.ncache.soft_limit_set);
        assert_eq!(opts.ccache.hard_limit, 12);
        assert_eq!(opts.capcache.reclaim_percentage, 50);
    }

    #[test]
    fn readahead_and_pool_flags_parse() {
        let opts = ClientOptions::parse([
            "--readahead-size=131072",
            "--readahead-count=16",
            "--readahead-readcnt=8",
            "--readahead-pinned",
            "--desc-count=32",
            "--desc-size=16384",
        ])
        .unwrap();
        assert_eq!(opts.readahead_size, 131072);
        assert_eq!(opts.readahead_count, 16);
        assert_eq!(opts.readahead_readcnt, 8);
        assert!(opts.readahead_pinned);
        assert_eq!(opts.desc_count, 32);
        assert_eq!(opts.desc_size, 16384);
    }

    #[test]
    fn log_flags_parse() {
        let opts = ClientOptions::parse([
            "--logfile=/tmp/x.log",
            "--logtype=syslog",
            "--logstamp=datetime",
            "--gossip-mask=racache,security",
        ])
        .unwrap();
        assert_eq!(opts.logfile, "/tmp/x.log");
        assert_eq!(opts.logtype, LogType::Syslog);
        assert_eq!(opts.logstamp, LogStamp::Datetime);
        assert_eq!(opts.gossip_mask, "racache,security");
    }

    #[test]
    fn unknown_flag_rejected() {
        match ClientOptions::parse(["--no-such-flag=1"]) {
            Err(ParseError::Unknown(flag)) => assert_eq!(flag, "--no-such-flag=1"),
            other => panic!("expected Unknown: {other:?}"),
        }
    }

    #[test]
    fn bad_value_rejected() {
        assert!(matches!(
            ClientOptions::parse(["--acache-timeout=abc"]),
            Err(ParseError::BadValue(_))
        ));
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(ClientOptions::parse(["--help"]), Err(ParseError::Help));
    }
}
