use std::path::{Path, PathBuf};

use crate::client::ClientConfig;
use crate::error::{Error, Result};

const DEFAULT_HOST: &str = "api.maap-project.org";
const DEFAULT_CONTENT_TYPE: &str = "application/echo10+xml";
const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Default)]
struct RcConfig {
    url: Option<String>,
    token: Option<String>,
    verify: Option<bool>,
}

pub(crate) fn load_config(
    url: Option<String>,
    token: Option<String>,
    verify: Option<bool>,
) -> Result<ClientConfig> {
    let mut url = url.or_else(|| std::env::var("MAAP_API_HOST").ok());
    let mut token = token.or_else(|| std::env::var("MAAP_TOKEN").ok());

    let rc_candidates = rc_candidates();
    let mut file_verify: Option<bool> = None;

    if url.is_none() || token.is_none() || verify.is_none() {
        for rc_path in &rc_candidates {
            if rc_path.exists() {
                let cfg = read_rc(rc_path).map_err(|e| {
                    Error::Config(format!(
                        "failed to read configuration file {}: {}",
                        rc_path.display(),
                        e
                    ))
                })?;

                if url.is_none() {
                    url = cfg.url;
                }
                if token.is_none() {
                    token = cfg.token;
                }
                file_verify = cfg.verify;
                break;
            }
        }
    }

    let url = normalize_api_root(url.as_deref().unwrap_or(DEFAULT_HOST));

    let token = match token {
        Some(v) => v,
        None => {
            if !rc_candidates.is_empty() {
                return Err(Error::Config(format!(
                    "Missing configuration: token (set MAAP_TOKEN or put `token:` in one of: {})",
                    rc_candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            return Err(Error::Config(
                "Missing configuration: token (set MAAP_TOKEN or create .maaprc)".to_string(),
            ));
        }
    };

    let verify = verify.or(file_verify).unwrap_or(true);

    let page_size = std::env::var("MAAP_CMR_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let content_type =
        std::env::var("MAAP_CMR_CONTENT_TYPE").unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string());
    let proxy_ticket = std::env::var("MAAP_PGT").ok().filter(|v| !v.is_empty());

    Ok(ClientConfig {
        url,
        token,
        verify,
        proxy_ticket,
        page_size,
        content_type,
    })
}

/// Accepts either a bare hostname (`api.maap-project.org`) or a full API
/// root URL and returns the root URL without a trailing slash.
fn normalize_api_root(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.trim_end_matches('/').to_string()
    } else {
        format!("https://{}/api", raw.trim_end_matches('/'))
    }
}

fn read_rc(path: &Path) -> std::io::Result<RcConfig> {
    let text = std::fs::read_to_string(path)?;
    let mut cfg = RcConfig::default();

    // Support formatting where `token:` is on one line and the value is on
    // the next line.
    let mut pending_key: Option<&str> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(pk) = pending_key {
            // Continuation value line (no colon)
            if !line.contains(':') {
                let v = strip_quotes(line);
                match pk {
                    "url" => cfg.url = Some(v.to_string()),
                    "token" => cfg.token = Some(v.to_string()),
                    _ => {}
                }
                pending_key = None;
                continue;
            }
            pending_key = None;
        }

        if let Some((k, v)) = line.split_once(':') {
            let k = k.trim();
            let v = strip_quotes(v.trim());
            match k {
                "url" => {
                    if !v.is_empty() {
                        cfg.url = Some(v.to_string());
                    } else {
                        pending_key = Some("url");
                    }
                }
                "token" => {
                    if !v.is_empty() {
                        cfg.token = Some(v.to_string());
                    } else {
                        pending_key = Some("token");
                    }
                }
                "verify" => {
                    if !v.is_empty() {
                        cfg.verify = Some(v != "0");
                    }
                }
                _ => {}
            }
        }
    }

    Ok(cfg)
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2)
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn rc_candidates() -> Vec<PathBuf> {
    // Search order:
    // 1) MAAP_RC (explicit)
    // 2) ./.maaprc (current working directory)
    // 3) ~/.maaprc
    if let Ok(p) = std::env::var("MAAP_RC") {
        return vec![PathBuf::from(p)];
    }

    let mut v = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        v.push(cwd.join(".maaprc"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".maaprc"));
    }
    v
}
