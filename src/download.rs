//! Data-plane transfers: HTTPS with 401 credential escalation, S3, and FTP.
//!
//! Every transfer stages into a `.part` file that is renamed into place on
//! completion and removed on failure, so an interrupted download leaves
//! neither a truncated destination nor a stale staging file.

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{AUTHORIZATION, CONNECTION};
use serde::Deserialize;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use suppaftp::FtpStream;
use suppaftp::types::FileType;

use crate::auth::{self, AuthContext};
use crate::error::{Error, Result};
use crate::util::double_urlencode;

/// GETs `url` into `dest`. The first attempt goes out unauthenticated; a 401
/// answer triggers the credential escalation for `auth`. Any other
/// non-success status is an [`Error::Api`].
pub(crate) fn fetch_http(
    http: &HttpClient,
    auth: &AuthContext,
    accept: &str,
    url: &str,
    dest: &Path,
    progress: bool,
) -> Result<PathBuf> {
    let resp = http.get(url).send()?;

    let resp = if resp.status() == StatusCode::UNAUTHORIZED {
        escalate(http, auth, accept, url, resp)?
    } else {
        check_status(resp, url)?
    };

    stream_to_file(resp, dest, progress)
}

/// Retries a 401'd fetch with escalated credentials.
///
/// Inside a DPS worker the job's machine token buys a short-lived user and
/// application token pair, and the retry goes to the URL the denied request
/// landed on after redirects. In a workspace the fetch is delegated to the
/// platform's authenticated relay. Without either context the 401 is final.
fn escalate(
    http: &HttpClient,
    auth: &AuthContext,
    accept: &str,
    url: &str,
    denied: Response,
) -> Result<Response> {
    match auth {
        AuthContext::JobRuntimeToken {
            machine_token,
            job_id,
            token_endpoint,
        } => {
            let grant = fetch_token_grant(http, token_endpoint, machine_token, job_id)?;
            let landed = denied.url().clone();
            let resp = http
                .get(landed)
                .header(
                    AUTHORIZATION,
                    auth::header_value(&format!(
                        "Bearer {},Basic {}",
                        grant.user_token, grant.app_token
                    ))?,
                )
                .header(CONNECTION, auth::header_value("close")?)
                .send()?;
            check_status(resp, url)
        }
        AuthContext::ProxyDelegate {
            token,
            proxy_ticket,
            relay_endpoint,
        } => {
            let relay_url = format!(
                "{}/{}/data",
                relay_endpoint.trim_end_matches('/'),
                double_urlencode(url)
            );
            let resp = http
                .get(&relay_url)
                .headers(auth::request_headers(accept, token, proxy_ticket.as_deref())?)
                .send()?;
            check_status(resp, &relay_url)
        }
        AuthContext::Unauthenticated => Err(Error::Unauthorized {
            url: url.to_string(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    user_token: String,
    app_token: String,
}

/// Trades the worker's machine token for a user and application token pair.
fn fetch_token_grant(
    http: &HttpClient,
    endpoint: &str,
    machine_token: &str,
    job_id: &str,
) -> Result<TokenGrant> {
    let resp = http
        .get(endpoint)
        .header("dps-machine-token", auth::header_value(machine_token)?)
        .header("dps-job-id", auth::header_value(job_id)?)
        .header(reqwest::header::ACCEPT, auth::header_value("application/json")?)
        .send()?;
    let resp = check_status(resp, endpoint)?;
    Ok(resp.json()?)
}

/// Downloads an S3 object using ambient AWS credentials.
///
/// The URL splits as `s3://<bucket>/<key>`; result documents sometimes put
/// an endpoint host in the bucket position, and those fail here so the
/// caller's HTTPS fallback can take over. The URL is parsed before the
/// runtime spins up, so a malformed URL fails without touching the network.
pub(crate) fn fetch_s3(url: &str, dest: &Path, progress: bool) -> Result<PathBuf> {
    let (bucket, key) = parse_s3_url(url)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let s3 = aws_sdk_s3::Client::new(&config);

        let mut object = s3
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Error::S3(format!("{}", aws_sdk_s3::error::DisplayErrorContext(&e))))?;

        let total = object.content_length().and_then(|l| u64::try_from(l).ok());
        let pb = if progress { Some(progress_bar(total)) } else { None };

        let part = part_path(dest);
        let mut out = std::fs::File::create(&part)?;
        let copied = async {
            while let Some(bytes) = object
                .body
                .try_next()
                .await
                .map_err(|e| Error::S3(format!("read from s3://{bucket}/{key}: {e}")))?
            {
                out.write_all(&bytes)?;
                if let Some(pb) = &pb {
                    pb.inc(bytes.len() as u64);
                }
            }
            out.flush()?;
            Ok(())
        }
        .await;
        drop(out);
        promote_part(copied, &part, dest)?;

        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }
        Ok(dest.to_path_buf())
    })
}

/// Downloads over anonymous FTP with a binary transfer.
pub(crate) fn fetch_ftp(url: &str, dest: &Path, progress: bool) -> Result<PathBuf> {
    let (addr, remote_path) = parse_ftp_url(url)?;

    let mut ftp = FtpStream::connect(&addr)?;
    ftp.login("anonymous", "anonymous")?;
    ftp.transfer_type(FileType::Binary)?;

    let pb = if progress { Some(progress_bar(None)) } else { None };

    let part = part_path(dest);
    let mut out = std::fs::File::create(&part)?;
    let transferred = ftp_transfer(&mut ftp, &remote_path, &mut out, pb.as_ref());
    drop(out);
    promote_part(transferred, &part, dest)?;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    Ok(dest.to_path_buf())
}

/// RETR into the staging file. The transfer counts as complete only once
/// the server's confirmation arrives on the control channel.
fn ftp_transfer(
    ftp: &mut FtpStream,
    remote_path: &str,
    out: &mut std::fs::File,
    pb: Option<&ProgressBar>,
) -> Result<()> {
    let mut reader = ftp.retr_as_stream(remote_path)?;
    copy_stream(&mut reader, out, pb)?;
    ftp.finalize_retr_stream(reader)?;
    ftp.quit()?;
    Ok(())
}

/// Splits `s3://<bucket>/<key>` the way a URL parser would: the authority
/// becomes the bucket and the path becomes the key.
pub(crate) fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::S3(format!("not an s3 URL: {url}")))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(Error::S3(format!("s3 URL missing bucket or key: {url}"))),
    }
}

/// Splits an `ftp://` URL into a `host:port` address (port 21 by default)
/// and an absolute remote path.
pub(crate) fn parse_ftp_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("ftp://")
        .ok_or_else(|| Error::Config(format!("not an ftp URL: {url}")))?;
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) if !host.is_empty() => (host, format!("/{path}")),
        _ => return Err(Error::Config(format!("ftp URL missing host or path: {url}"))),
    };
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:21")
    };
    Ok((addr, path))
}

fn check_status(resp: Response, url: &str) -> Result<Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        return Err(Error::Api {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp)
}

fn stream_to_file(resp: Response, dest: &Path, progress: bool) -> Result<PathBuf> {
    let pb = if progress {
        Some(progress_bar(resp.content_length()))
    } else {
        None
    };

    let part = part_path(dest);
    let mut out = std::fs::File::create(&part)?;
    let copied = copy_stream(resp, &mut out, pb.as_ref()).map(|_| ());
    drop(out);
    promote_part(copied, &part, dest)?;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    Ok(dest.to_path_buf())
}

fn copy_stream<R: Read>(
    mut from: R,
    out: &mut std::fs::File,
    pb: Option<&ProgressBar>,
) -> Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(pb) = pb {
            pb.inc(n as u64);
        }
    }
    out.flush()?;
    Ok(total)
}

/// `dest` plus a `.part` suffix, keeping the real extension.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Completes a staged transfer: renames the `.part` file into place, or
/// removes it when the transfer (or the rename itself) failed.
fn promote_part(staged: Result<()>, part: &Path, dest: &Path) -> Result<()> {
    let done = staged.and_then(|()| std::fs::rename(part, dest).map_err(Error::from));
    if done.is_err() {
        let _ = std::fs::remove_file(part);
    }
    done
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar} {eta}",
                )
                .unwrap()
                .progress_chars("=>-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    }
}
