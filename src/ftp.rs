//! Listing Client (C2): an FTP session wrapper exposing exactly the
//! primitives the Tree Walker, Reconciler and Restore Planner need,
//! abstracting over MLSD vs LIST+MDTM feature detection.

use crate::error::BackupError;
use std::io::{Read, Write};
use std::path::Path;
use suppaftp::{FtpStream, Mode};

/// One parsed MLSD listing line (RFC 3659): `type` and `modify` facts kept,
/// everything else discarded, `cdir`/`pdir` entries dropped by the caller.
#[derive(Debug, Clone)]
pub struct MlsdEntry {
    pub name: String,
    pub is_directory: bool,
    pub modify: String,
}

/// A single directory listing, independent of which protocol produced it.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    pub name: String,
    pub is_directory: bool,
    pub modify_date: String,
}

/// Trait boundary between the Tree Walker/Reconciler/Restore Planner and
/// the concrete transport, so the algorithmic core can be unit-tested
/// against an in-memory fake without a real FTP server (§4.2, §5
/// "Reentrancy": exactly one owner per session, never shared).
pub trait ListingSession {
    /// Drop the current connection and log in again from scratch. Used by
    /// the Tree Walker's one-shot reconnect-and-resume protocol (§4.4) when
    /// a transport exception interrupts a directory read.
    fn reconnect(&mut self) -> Result<(), BackupError>;
    fn supports_mlsd(&mut self) -> Result<bool, BackupError>;
    fn supports_mdtm(&mut self) -> Result<bool, BackupError>;
    fn cwd(&mut self, dir: &str) -> Result<(), BackupError>;
    fn cdup(&mut self) -> Result<(), BackupError>;
    fn list_mlsd(&mut self) -> Result<Vec<MlsdEntry>, BackupError>;
    fn list_names(&mut self) -> Result<Vec<String>, BackupError>;
    fn mdtm(&mut self, name: &str) -> Result<String, BackupError>;
    fn download(&mut self, src: &str, dst: &Path) -> Result<u32, BackupError>;
    fn upload(&mut self, src: &Path) -> Result<(), BackupError>;
    fn mkdir(&mut self, name: &str) -> Result<(), BackupError>;
    fn recursive_remove(&mut self, path: &str) -> Result<(), BackupError>;
    fn send_command(&mut self, verb: &str, arg: Option<&str>) -> Result<String, BackupError>;
}

/// Production `ListingSession` backed by `suppaftp::FtpStream`.
pub struct ListingClient {
    host: String,
    port: u16,
    login: String,
    password: String,
    timeout_secs: u64,
    stream: FtpStream,
    mlsd: Option<bool>,
    mdtm: Option<bool>,
}

impl ListingClient {
    /// Connect, login, and apply the configured socket timeout. `timeout`
    /// of 0 leaves the driver default in place.
    pub fn connect(
        host: &str,
        port: u16,
        login: &str,
        password: &str,
        timeout_secs: u64,
    ) -> Result<Self, BackupError> {
        let stream = Self::open_stream(host, port, login, password, timeout_secs)?;
        Ok(Self {
            host: host.to_string(),
            port,
            login: login.to_string(),
            password: password.to_string(),
            timeout_secs,
            stream,
            mlsd: None,
            mdtm: None,
        })
    }

    fn open_stream(
        host: &str,
        port: u16,
        login: &str,
        password: &str,
        timeout_secs: u64,
    ) -> Result<FtpStream, BackupError> {
        let addr = format!("{host}:{port}");
        let mut stream = if timeout_secs > 0 {
            FtpStream::connect_timeout(&addr, std::time::Duration::from_secs(timeout_secs))
                .map_err(|e| BackupError::Transport(format!("connect to {addr} failed: {e}")))?
        } else {
            FtpStream::connect(&addr)
                .map_err(|e| BackupError::Transport(format!("connect to {addr} failed: {e}")))?
        };
        stream
            .login(login, password)
            .map_err(|e| BackupError::Transport(format!("login failed: {e}")))?;
        stream.transfer_type(suppaftp::types::FileType::Binary).ok();
        stream.set_mode(Mode::Passive);
        Ok(stream)
    }

    fn feat_response(&mut self) -> Result<String, BackupError> {
        self.stream
            .feat()
            .map_err(|e| BackupError::Transport(format!("FEAT failed: {e}")))
            .map(|r| r.body)
    }
}

impl ListingSession for ListingClient {
    fn reconnect(&mut self) -> Result<(), BackupError> {
        self.stream =
            Self::open_stream(&self.host, self.port, &self.login, &self.password, self.timeout_secs)?;
        self.mlsd = None;
        self.mdtm = None;
        Ok(())
    }

    fn supports_mlsd(&mut self) -> Result<bool, BackupError> {
        if let Some(v) = self.mlsd {
            return Ok(v);
        }
        let resp = self.feat_response()?;
        let v = resp.to_ascii_uppercase().contains("MLSD");
        self.mlsd = Some(v);
        Ok(v)
    }

    fn supports_mdtm(&mut self) -> Result<bool, BackupError> {
        if let Some(v) = self.mdtm {
            return Ok(v);
        }
        let resp = self.feat_response()?;
        let v = resp.to_ascii_uppercase().contains("MDTM");
        self.mdtm = Some(v);
        Ok(v)
    }

    fn cwd(&mut self, dir: &str) -> Result<(), BackupError> {
        self.stream
            .cwd(dir)
            .map_err(|e| BackupError::Transport(format!("CWD {dir} failed: {e}")))
    }

    fn cdup(&mut self) -> Result<(), BackupError> {
        self.stream
            .cdup()
            .map_err(|e| BackupError::Transport(format!("CDUP failed: {e}")))
    }

    fn list_mlsd(&mut self) -> Result<Vec<MlsdEntry>, BackupError> {
        let lines = self
            .stream
            .mlsd(None)
            .map_err(|e| BackupError::Transport(format!("MLSD failed: {e}")))?;
        Ok(lines
            .into_iter()
            .filter_map(|line| parse_mlsd_line(&line))
            .collect())
    }

    fn list_names(&mut self) -> Result<Vec<String>, BackupError> {
        let lines = self
            .stream
            .nlst(None)
            .map_err(|e| BackupError::Transport(format!("LIST failed: {e}")))?;
        Ok(lines
            .into_iter()
            .filter(|name| !is_dot_entry(name))
            .collect())
    }

    fn mdtm(&mut self, name: &str) -> Result<String, BackupError> {
        self.stream
            .mdtm(name)
            .map(|dt| dt.format("%Y%m%d%H%M%S").to_string())
            .map_err(|e| BackupError::Transport(format!("MDTM {name} failed: {e}")))
    }

    fn download(&mut self, src: &str, dst: &Path) -> Result<u32, BackupError> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackupError::PerEntry {
                    path: src.to_string(),
                    reason: format!("cannot create staging dir: {e}"),
                }
            })?;
        }
        let mut out = std::fs::File::create(dst).map_err(|e| BackupError::PerEntry {
            path: src.to_string(),
            reason: format!("cannot create staging file: {e}"),
        })?;

        let mut reader = self
            .stream
            .retr_as_stream(src)
            .map_err(|e| BackupError::Transport(format!("RETR {src} failed: {e}")))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = reader.read(&mut buf).map_err(|e| BackupError::PerEntry {
                path: src.to_string(),
                reason: format!("read failed: {e}"),
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).map_err(|e| BackupError::PerEntry {
                path: src.to_string(),
                reason: format!("write failed: {e}"),
            })?;
        }
        self.stream
            .finalize_retr_stream(reader)
            .map_err(|e| BackupError::Transport(format!("finalize RETR {src} failed: {e}")))?;
        Ok(hasher.finalize())
    }

    fn upload(&mut self, src: &Path) -> Result<(), BackupError> {
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if src.is_dir() {
            self.mkdir(&name).ok();
            self.cwd(&name)?;
            let mut entries: Vec<_> = std::fs::read_dir(src)
                .map_err(|e| BackupError::Transport(format!("read_dir {}: {e}", src.display())))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect();
            entries.sort();
            for entry in entries {
                self.upload(&entry)?;
            }
            self.cdup()?;
        } else {
            let mut file = std::fs::File::open(src)
                .map_err(|e| BackupError::Transport(format!("open {}: {e}", src.display())))?;
            self.stream
                .put_file(&name, &mut file)
                .map_err(|e| BackupError::Transport(format!("STOR {name} failed: {e}")))?;
        }
        Ok(())
    }

    fn mkdir(&mut self, name: &str) -> Result<(), BackupError> {
        self.stream
            .mkdir(name)
            .map_err(|e| BackupError::Transport(format!("MKD {name} failed: {e}")))
    }

    fn recursive_remove(&mut self, path: &str) -> Result<(), BackupError> {
        if self.cwd(path).is_err() {
            // Not a directory (or doesn't exist as one) — try removing as a file.
            self.stream.rm(path).ok();
            return Ok(());
        }
        let names = self.list_names()?;
        for name in names {
            self.recursive_remove(&name)?;
        }
        self.cdup()?;
        self.stream
            .rmdir(path)
            .map_err(|e| BackupError::Transport(format!("RMD {path} failed: {e}")))
    }

    fn send_command(&mut self, verb: &str, arg: Option<&str>) -> Result<String, BackupError> {
        let command = match arg {
            Some(arg) => format!("{verb} {arg}"),
            None => verb.to_string(),
        };
        let response = self
            .stream
            .quote(&command)
            .map_err(|e| BackupError::Transport(format!("{command} failed: {e}")))?;
        Ok(response.body)
    }
}

fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Parse one MLSD line: `;`-delimited `fact=value` pairs followed by the
/// file name (always the last token). `cdir`/`pdir` entries return `None`
/// (already-skipped, per §4.2) and `.`/`..` names are filtered as well.
pub fn parse_mlsd_line(line: &str) -> Option<MlsdEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    let tokens: Vec<&str> = line.split(';').collect();
    if tokens.is_empty() {
        return None;
    }
    let name = tokens.last().unwrap().trim();
    if name.is_empty() || is_dot_entry(name) {
        return None;
    }

    let mut facts = std::collections::HashMap::new();
    for tok in &tokens[..tokens.len() - 1] {
        let tok = tok.trim();
        if let Some((k, v)) = tok.split_once('=') {
            facts.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }

    let ty = facts.get("type").map(String::as_str).unwrap_or("");
    if ty == "cdir" || ty == "pdir" {
        return None;
    }

    Some(MlsdEntry {
        name: name.to_string(),
        is_directory: ty == "dir",
        modify: facts.get("modify").cloned().unwrap_or_default(),
    })
}
