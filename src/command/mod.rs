//! Parses a decoded RESP array into a typed `Command` (C5, parsing half).
use thiserror::Error;

use crate::resp::Frame;

#[derive(Debug, Clone)]
pub enum Command {
    Ping,
    Echo(Vec<u8>),
    Set {
        key: String,
        value: Vec<u8>,
        px: Option<i64>,
    },
    Get {
        key: String,
    },
    Type {
        key: String,
    },
    Keys {
        pattern: String,
    },
    XAdd {
        key: String,
        id_spec: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    XRange {
        key: String,
        start: String,
        end: String,
    },
    XRead {
        block_ms: Option<i64>,
        pairs: Vec<(String, String)>,
    },
    Info {
        section: Option<String>,
    },
    ConfigGet {
        key: String,
    },
    ReplConf {
        args: Vec<String>,
    },
    Psync,
    Wait {
        numreplicas: i64,
        timeout_ms: i64,
    },
    Select {
        index: i64,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("ERR protocol error: expected array of bulk strings")]
    IncorrectFormat,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("Unknown command")]
    UnknownCommand(String),

    #[error("ERR Unsupported CONFIG parameter: {0}")]
    UnknownConfigKey(String),

    #[error("ERR syntax error")]
    Syntax,
}

impl Command {
    pub fn is_write(&self) -> bool {
        matches!(self, Command::Set { .. } | Command::XAdd { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Echo(_) => "ECHO",
            Command::Set { .. } => "SET",
            Command::Get { .. } => "GET",
            Command::Type { .. } => "TYPE",
            Command::Keys { .. } => "KEYS",
            Command::XAdd { .. } => "XADD",
            Command::XRange { .. } => "XRANGE",
            Command::XRead { .. } => "XREAD",
            Command::Info { .. } => "INFO",
            Command::ConfigGet { .. } => "CONFIG",
            Command::ReplConf { .. } => "REPLCONF",
            Command::Psync => "PSYNC",
            Command::Wait { .. } => "WAIT",
            Command::Select { .. } => "SELECT",
        }
    }

    pub fn parse(frame: &Frame) -> Result<Command, CommandError> {
        let items = match frame {
            Frame::Array(items) => items,
            _ => return Err(CommandError::IncorrectFormat),
        };
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            args.push(item.as_bulk_bytes().ok_or(CommandError::IncorrectFormat)?);
        }
        let name = args.first().ok_or(CommandError::IncorrectFormat)?;
        let name = std::str::from_utf8(name).map_err(|_| CommandError::IncorrectFormat)?;

        let as_str = |b: &[u8]| -> Result<String, CommandError> {
            std::str::from_utf8(b)
                .map(|s| s.to_string())
                .map_err(|_| CommandError::IncorrectFormat)
        };

        match name.to_ascii_uppercase().as_str() {
            "PING" => Ok(Command::Ping),
            "ECHO" => {
                let arg = args.get(1).ok_or(CommandError::WrongArity("echo"))?;
                Ok(Command::Echo(arg.to_vec()))
            }
            "SET" => {
                if args.len() < 3 {
                    return Err(CommandError::WrongArity("set"));
                }
                let key = as_str(args[1])?;
                let value = args[2].to_vec();
                let px = if args.len() >= 5 && as_str(args[3])?.eq_ignore_ascii_case("px") {
                    Some(as_str(args[4])?.parse().map_err(|_| CommandError::Syntax)?)
                } else if args.len() == 3 {
                    None
                } else {
                    return Err(CommandError::Syntax);
                };
                Ok(Command::Set { key, value, px })
            }
            "GET" => {
                let key = as_str(args.get(1).ok_or(CommandError::WrongArity("get"))?)?;
                Ok(Command::Get { key })
            }
            "TYPE" => {
                let key = as_str(args.get(1).ok_or(CommandError::WrongArity("type"))?)?;
                Ok(Command::Type { key })
            }
            "KEYS" => {
                let pattern = as_str(args.get(1).ok_or(CommandError::WrongArity("keys"))?)?;
                Ok(Command::Keys { pattern })
            }
            "XADD" => {
                if args.len() < 5 || (args.len() - 3) % 2 != 0 {
                    return Err(CommandError::WrongArity("xadd"));
                }
                let key = as_str(args[1])?;
                let id_spec = as_str(args[2])?;
                let mut fields = Vec::new();
                let mut i = 3;
                while i + 1 < args.len() {
                    fields.push((as_str(args[i])?, args[i + 1].to_vec()));
                    i += 2;
                }
                Ok(Command::XAdd { key, id_spec, fields })
            }
            "XRANGE" => {
                if args.len() != 4 {
                    return Err(CommandError::WrongArity("xrange"));
                }
                Ok(Command::XRange {
                    key: as_str(args[1])?,
                    start: as_str(args[2])?,
                    end: as_str(args[3])?,
                })
            }
            "XREAD" => {
                let mut idx = 1;
                let mut block_ms = None;
                if args.get(idx).map(|a| as_str(a)).transpose()?.as_deref().map(|s| s.eq_ignore_ascii_case("block")).unwrap_or(false) {
                    let ms: i64 = as_str(args.get(idx + 1).ok_or(CommandError::Syntax)?)?
                        .parse()
                        .map_err(|_| CommandError::Syntax)?;
                    block_ms = Some(ms);
                    idx += 2;
                }
                let is_streams_kw = args
                    .get(idx)
                    .map(|a| as_str(a))
                    .transpose()?
                    .map(|s| s.eq_ignore_ascii_case("streams"))
                    .unwrap_or(false);
                if !is_streams_kw {
                    return Err(CommandError::Syntax);
                }
                idx += 1;
                let rest: Vec<String> = args[idx..]
                    .iter()
                    .map(|a| as_str(a))
                    .collect::<Result<_, _>>()?;
                let pairs = crate::utils::to_pairs(&rest).ok_or(CommandError::Syntax)?;
                Ok(Command::XRead { block_ms, pairs })
            }
            "INFO" => {
                let section = args.get(1).map(|a| as_str(a)).transpose()?;
                Ok(Command::Info { section })
            }
            "CONFIG" => {
                let sub = as_str(args.get(1).ok_or(CommandError::WrongArity("config"))?)?;
                if !sub.eq_ignore_ascii_case("get") {
                    return Err(CommandError::UnknownConfigKey(sub));
                }
                let key = as_str(args.get(2).ok_or(CommandError::WrongArity("config"))?)?;
                Ok(Command::ConfigGet { key })
            }
            "REPLCONF" => {
                let rest: Vec<String> = args[1..]
                    .iter()
                    .map(|a| as_str(a))
                    .collect::<Result<_, _>>()?;
                Ok(Command::ReplConf { args: rest })
            }
            "PSYNC" => Ok(Command::Psync),
            "WAIT" => {
                if args.len() != 3 {
                    return Err(CommandError::WrongArity("wait"));
                }
                let numreplicas = as_str(args[1])?.parse().map_err(|_| CommandError::Syntax)?;
                let timeout_ms = as_str(args[2])?.parse().map_err(|_| CommandError::Syntax)?;
                Ok(Command::Wait { numreplicas, timeout_ms })
            }
            "SELECT" => {
                let index = as_str(args.get(1).ok_or(CommandError::WrongArity("select"))?)?
                    .parse()
                    .map_err(|_| CommandError::Syntax)?;
                Ok(Command::Select { index })
            }
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_array(parts: &[&str]) -> Frame {
        Frame::Array(parts.iter().map(|p| Frame::Bulk(p.as_bytes().to_vec())).collect())
    }

    #[test]
    fn parses_ping() {
        let cmd = Command::parse(&bulk_array(&["PING"])).unwrap();
        assert!(matches!(cmd, Command::Ping));
    }

    #[test]
    fn parses_set_with_px() {
        let cmd = Command::parse(&bulk_array(&["SET", "foo", "bar", "PX", "100"])).unwrap();
        match cmd {
            Command::Set { key, value, px } => {
                assert_eq!(key, "foo");
                assert_eq!(value, b"bar");
                assert_eq!(px, Some(100));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn set_without_value_is_wrong_arity() {
        let err = Command::parse(&bulk_array(&["SET", "foo"])).unwrap_err();
        assert!(matches!(err, CommandError::WrongArity("set")));
    }

    #[test]
    fn parses_xread_with_block() {
        let cmd = Command::parse(&bulk_array(&["XREAD", "BLOCK", "0", "STREAMS", "s1", "s2", "0-0", "$"])).unwrap();
        match cmd {
            Command::XRead { block_ms, pairs } => {
                assert_eq!(block_ms, Some(0));
                assert_eq!(pairs, vec![("s1".to_string(), "0-0".to_string()), ("s2".to_string(), "$".to_string())]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = Command::parse(&bulk_array(&["FROBNICATE"])).unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(_)));
    }
}
