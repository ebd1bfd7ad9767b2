//! CLI flags and the line-oriented configuration file format.
//!
//! The file format is order-insensitive apart from block nesting: a single
//! `Listen ip:port` line and one or more `<logical_host>` blocks, each
//! wrapping `<name>`, `<port>`, and `<conns>` tags. Unknown lines are
//! ignored. This mirrors the original C++ proxy's hand-rolled parser line
//! for line; there is no existing serde format (TOML/JSON/YAML) that fits
//! this ad hoc tag grammar, so it stays hand-written.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::error::ConfigError;

pub const MAX_UPSTREAMS: usize = 16;

/// One `<logical_host>` entry: a backend the proxy forwards to. `addr` is
/// resolved from `name` at parse time, so a malformed `<name>` is a
/// `ConfigError` at startup rather than a silent substitution further down
/// the line — `name` is kept around only for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub conncnt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: SocketAddr,
    pub upstreams: Vec<HostDescriptor>,
}

/// `prog [-h] [-v] [-x] -f <config>`
#[derive(Debug, Parser)]
#[command(name = "relaypoold", version, about = "TCP reverse proxy / load balancer")]
pub struct Cli {
    /// Configuration file path.
    #[arg(short = 'f', long = "config", required = true)]
    pub config: PathBuf,

    /// Set the log level to DEBUG.
    #[arg(short = 'x', long = "debug")]
    pub debug: bool,
}

#[derive(Default)]
struct HostBuilder {
    name: Option<String>,
    port: Option<u16>,
    conncnt: Option<u32>,
}

impl HostBuilder {
    fn finish(self) -> Result<HostDescriptor, ConfigError> {
        let name = self.name.ok_or(ConfigError::MalformedTag {
            tag: "name",
            value: String::new(),
        })?;
        let port = self.port.ok_or(ConfigError::MalformedTag {
            tag: "port",
            value: String::new(),
        })?;
        let conncnt = self.conncnt.ok_or(ConfigError::MalformedTag {
            tag: "conns",
            value: String::new(),
        })?;
        let addr: IpAddr = name
            .parse()
            .map_err(|_| ConfigError::BadUpstreamAddr(name.clone()))?;
        Ok(HostDescriptor {
            name,
            addr,
            port,
            conncnt,
        })
    }
}

/// Extracts the text between `<tag>` and `</tag>` on the same line, if
/// present.
fn extract_tag<'a>(line: &'a str, tag: &'static str) -> Option<Result<&'a str, ConfigError>> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = line.find(&open)?;
    let value_start = start + open.len();
    match line[value_start..].find(&close) {
        Some(rel_end) => Some(Ok(&line[value_start..value_start + rel_end])),
        None => Some(Err(ConfigError::MalformedTag {
            tag,
            value: line.to_string(),
        })),
    }
}

pub fn parse_str(contents: &str) -> Result<Config, ConfigError> {
    let mut listen: Option<SocketAddr> = None;
    let mut upstreams = Vec::new();
    let mut open_block: Option<HostBuilder> = None;

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if line.contains("<logical_host>") {
            if open_block.is_some() {
                return Err(ConfigError::OverlappingHostBlock);
            }
            open_block = Some(HostBuilder::default());
            continue;
        }

        if line.contains("</logical_host>") {
            let builder = open_block.take().ok_or(ConfigError::UnopenedHostBlock)?;
            upstreams.push(builder.finish()?);
            continue;
        }

        if let Some(name_res) = extract_tag(line, "name") {
            let builder = open_block
                .as_mut()
                .ok_or(ConfigError::UnopenedHostBlock)?;
            builder.name = Some(name_res?.to_string());
            continue;
        }

        if let Some(port_res) = extract_tag(line, "port") {
            let value = port_res?;
            let port: u16 = value.trim().parse().map_err(|_| ConfigError::MalformedTag {
                tag: "port",
                value: value.to_string(),
            })?;
            let builder = open_block
                .as_mut()
                .ok_or(ConfigError::UnopenedHostBlock)?;
            builder.port = Some(port);
            continue;
        }

        if let Some(conns_res) = extract_tag(line, "conns") {
            let value = conns_res?;
            let conncnt: u32 = value
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::MalformedTag {
                    tag: "conns",
                    value: value.to_string(),
                })?;
            let builder = open_block
                .as_mut()
                .ok_or(ConfigError::UnopenedHostBlock)?;
            builder.conncnt = Some(conncnt);
            continue;
        }

        if let Some(rest) = line.strip_prefix("Listen ") {
            let addr: SocketAddr = rest
                .trim()
                .parse()
                .map_err(|_| ConfigError::MalformedListen(rest.to_string()))?;
            listen = Some(addr);
            continue;
        }

        // Unknown lines are ignored per the format spec.
    }

    if open_block.is_some() {
        return Err(ConfigError::UnclosedHostBlock);
    }

    let listen = listen.ok_or(ConfigError::MissingListen)?;
    if upstreams.is_empty() {
        return Err(ConfigError::MissingUpstream);
    }
    if upstreams.len() > MAX_UPSTREAMS {
        return Err(ConfigError::TooManyUpstreams(upstreams.len()));
    }

    Ok(Config { listen, upstreams })
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_str(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let input = "Listen 127.0.0.1:8080\n\
                     <logical_host>\n\
                     <name>10.0.0.1</name>\n\
                     <port>9001</port>\n\
                     <conns>4</conns>\n\
                     </logical_host>\n";
        let cfg = parse_str(input).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(cfg.upstreams.len(), 1);
        assert_eq!(cfg.upstreams[0].name, "10.0.0.1");
        assert_eq!(cfg.upstreams[0].port, 9001);
        assert_eq!(cfg.upstreams[0].conncnt, 4);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let input = "# comment\n\
                     Listen 127.0.0.1:8080\n\
                     something else entirely\n\
                     <logical_host>\n\
                     <name>10.0.0.2</name>\n\
                     <port>80</port>\n\
                     <conns>1</conns>\n\
                     </logical_host>\n";
        assert!(parse_str(input).is_ok());
    }

    #[test]
    fn multiple_upstreams() {
        let input = "Listen 0.0.0.0:80\n\
                     <logical_host>\n<name>10.0.0.1</name>\n<port>1</port>\n<conns>1</conns>\n</logical_host>\n\
                     <logical_host>\n<name>10.0.0.2</name>\n<port>2</port>\n<conns>2</conns>\n</logical_host>\n";
        let cfg = parse_str(input).unwrap();
        assert_eq!(cfg.upstreams.len(), 2);
        assert_eq!(cfg.upstreams[1].name, "10.0.0.2");
    }

    #[test]
    fn missing_listen_is_an_error() {
        let input = "<logical_host>\n<name>10.0.0.1</name>\n<port>1</port>\n<conns>1</conns>\n</logical_host>\n";
        assert!(matches!(parse_str(input), Err(ConfigError::MissingListen)));
    }

    #[test]
    fn malformed_upstream_name_is_rejected() {
        let input = "Listen 127.0.0.1:80\n\
                     <logical_host>\n<name>host.example</name>\n<port>1</port>\n<conns>1</conns>\n</logical_host>\n";
        assert!(matches!(
            parse_str(input),
            Err(ConfigError::BadUpstreamAddr(_))
        ));
    }

    #[test]
    fn missing_upstream_is_an_error() {
        let input = "Listen 127.0.0.1:80\n";
        assert!(matches!(parse_str(input), Err(ConfigError::MissingUpstream)));
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let input = "Listen 127.0.0.1:80\n\
                     <logical_host>\n<logical_host>\n</logical_host>\n</logical_host>\n";
        assert!(matches!(
            parse_str(input),
            Err(ConfigError::OverlappingHostBlock)
        ));
    }

    #[test]
    fn unclosed_block_is_rejected() {
        let input = "Listen 127.0.0.1:80\n<logical_host>\n<name>a</name>\n<port>1</port>\n<conns>1</conns>\n";
        assert!(matches!(
            parse_str(input),
            Err(ConfigError::UnclosedHostBlock)
        ));
    }

    #[test]
    fn zero_conns_is_rejected() {
        let input = "Listen 127.0.0.1:80\n\
                     <logical_host>\n<name>10.0.0.1</name>\n<port>1</port>\n<conns>0</conns>\n</logical_host>\n";
        assert!(parse_str(input).is_err());
    }

    #[test]
    fn too_many_upstreams_is_rejected() {
        let mut input = String::from("Listen 127.0.0.1:80\n");
        for i in 0..17 {
            input.push_str(&format!(
                "<logical_host>\n<name>10.0.0.{i}</name>\n<port>1</port>\n<conns>1</conns>\n</logical_host>\n"
            ));
        }
        assert!(matches!(
            parse_str(&input),
            Err(ConfigError::TooManyUpstreams(17))
        ));
    }
}
