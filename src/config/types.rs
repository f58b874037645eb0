use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::exec::{Executor, Pipeline, PipelineError};

/// How long a pipeline may run before its stages are stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Never,
    Secs(u64),
}

impl Deadline {
    pub fn resolve(self) -> Option<Duration> {
        match self {
            Deadline::Never => None,
            Deadline::Secs(n) => Some(Duration::from_secs(n)),
        }
    }
}

impl Serialize for Deadline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Deadline::Never => serializer.serialize_str("none"),
            Deadline::Secs(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Deadline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DeadlineVisitor;

        impl<'de> Visitor<'de> for DeadlineVisitor {
            type Value = Deadline;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"none\" or a positive number of seconds")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Deadline, E> {
                if value == 0 {
                    return Err(E::custom("timeout must be a positive number of seconds"));
                }
                Ok(Deadline::Secs(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Deadline, E> {
                if value <= 0 {
                    return Err(E::custom("timeout must be a positive number of seconds"));
                }
                Ok(Deadline::Secs(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Deadline, E> {
                if value.eq_ignore_ascii_case("none") {
                    Ok(Deadline::Never)
                } else {
                    Err(E::custom("timeout must be \"none\" or a positive number of seconds"))
                }
            }
        }

        deserializer.deserialize_any(DeadlineVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeout: Deadline,
    pub poll_interval_ms: u64,
    pub term_grace_ms: u64,
    pub fail_fast: bool,
    /// Network interface probed by `pipex ip`.
    pub interface: String,
    /// Named pipelines, one command line per stage.
    pub pipelines: BTreeMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Deadline::Secs(60),
            poll_interval_ms: 10,
            term_grace_ms: 500,
            fail_fast: true,
            interface: "wlan0".to_string(),
            pipelines: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn executor(&self) -> Executor {
        Executor::new()
            .timeout(self.timeout.resolve())
            .poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
            .term_grace(Duration::from_millis(self.term_grace_ms))
            .fail_fast(self.fail_fast)
    }

    /// Look up and parse a named pipeline. `Ok(None)` if no such name.
    pub fn pipeline(&self, name: &str) -> Result<Option<Pipeline>, PipelineError> {
        self.pipelines
            .get(name)
            .map(|lines| Pipeline::parse(lines))
            .transpose()
    }
}
