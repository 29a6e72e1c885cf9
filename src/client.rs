use reqwest::blocking::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::auth::{self, AuthContext};
use crate::cmr::{self, SearchQuery};
use crate::config::load_config;
use crate::download;
use crate::error::{Error, Result};
use crate::granule::{Collection, Granule, Location, Scheme, resolve_location};
use crate::job::{Job, JobSpec, JobStatus, SubmissionAck};
use crate::poll::{self, PollConfig, Probe};
use crate::util::{host_of, urljoin};
use crate::wps;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base MAAP API URL, typically `https://api.maap-project.org/api`.
    pub url: String,
    /// Platform access token, sent with every API request.
    pub token: String,
    /// Whether to verify TLS certificates.
    pub verify: bool,
    /// CAS proxy-granting ticket, forwarded as the `proxy-ticket` header.
    pub proxy_ticket: Option<String>,
    /// Result count requested per catalog search page.
    pub page_size: usize,
    /// MIME type requested from the catalog endpoints.
    pub content_type: String,
}

/// Blocking MAAP client: job submission and lifecycle, catalog search, and
/// authenticated granule retrieval.
///
/// Clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    api_root: String,
    token: String,
    content_type: String,
    proxy_ticket: Option<String>,
    page_size: usize,

    timeout: Duration,
    poll: PollConfig,
    progress: bool,
    cancel: Option<Arc<AtomicBool>>,
    auth: AuthContext,

    http: HttpClient,
}

impl Client {
    /// Creates a client using environment variables and/or `.maaprc`.
    ///
    /// This is equivalent to `Client::new(None, None, None)`.
    pub fn from_env() -> Result<Self> {
        Self::new(None, None, None)
    }

    /// Creates a client using (in order of precedence):
    /// - explicit `url`/`token` arguments
    /// - environment variables `MAAP_API_HOST` / `MAAP_TOKEN`
    /// - config file from `MAAP_RC` or `.maaprc`
    pub fn new(url: Option<String>, token: Option<String>, verify: Option<bool>) -> Result<Self> {
        Self::from_config(load_config(url, token, verify)?)
    }

    /// Creates a client from an already-resolved configuration.
    pub fn from_config(cfg: ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("maap-rs/{}", env!("CARGO_PKG_VERSION")))
                .unwrap_or(HeaderValue::from_static("maap-rs")),
        );

        let mut builder = HttpClient::builder().default_headers(default_headers);
        if !cfg.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        let auth = auth::detect(
            &cfg.token,
            cfg.proxy_ticket.as_deref(),
            &urljoin(&cfg.url, "members/dps/userImpersonationToken"),
            &urljoin(&cfg.url, "cmr/granules"),
        )?;

        Ok(Self {
            api_root: cfg.url,
            token: cfg.token,
            content_type: cfg.content_type,
            proxy_ticket: cfg.proxy_ticket,
            page_size: cfg.page_size,
            timeout: Duration::from_secs(60),
            poll: PollConfig::default(),
            progress: true,
            cancel: None,
            auth,
            http,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Shares a flag that aborts in-flight waits when set from another
    /// thread. The wait returns [`Error::Cancelled`] within ~250ms.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Overrides the authentication context resolved at construction.
    pub fn with_auth_context(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    /// Submits a job. This call never fails: transport errors, HTTP errors,
    /// and rejection documents all come back as a `Failed` job whose
    /// `error_details` say what went wrong.
    pub fn submit_job(&self, spec: &JobSpec) -> Job {
        Job::from_ack(&self.submission_ack(spec))
    }

    fn submission_ack(&self, spec: &JobSpec) -> SubmissionAck {
        let headers = match self.api_headers() {
            Ok(headers) => headers,
            Err(e) => return SubmissionAck::failed(None, format!("invalid request headers: {e}")),
        };

        let sent = self
            .http
            .post(self.dps_job_url())
            .headers(headers)
            .timeout(self.timeout)
            .body(wps::build_execute(spec))
            .send();

        match sent {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().unwrap_or_default();
                wps::parse_submission_ack(status, &body)
            }
            Err(e) => SubmissionAck::failed(None, format!("submission failed: {e}")),
        }
    }

    /// Re-reads the job's status document. The service echoes the job id in
    /// the document; when present it replaces `job.id`.
    pub fn refresh_status(&self, job: &mut Job) -> Result<JobStatus> {
        let body = self.api_text("GET", &self.job_status_url(&job.id))?;
        let info = wps::parse_status(&body)?;
        if let Some(id) = info.job_id {
            job.id = id;
        }
        job.status = info.status;
        Ok(job.status)
    }

    /// Re-reads the job's result document, replacing any outputs already on
    /// the job. Error lines in the document are joined into `error_details`.
    pub fn refresh_result(&self, job: &mut Job) -> Result<()> {
        let body = self.api_text("GET", &self.job_result_url(&job.id))?;
        let doc = wps::parse_results(&body)?;
        job.outputs = doc.outputs;
        if !doc.errors.is_empty() {
            job.error_details = Some(doc.errors.join("\n"));
        }
        Ok(())
    }

    pub fn refresh_metrics(&self, job: &mut Job) -> Result<()> {
        let body = self.api_text("GET", &self.job_metrics_url(&job.id))?;
        job.metrics = wps::parse_metrics(&body)?;
        Ok(())
    }

    /// Refreshes status, then best-effort results and metrics for jobs that
    /// finished. Result and metrics fetch failures are logged and swallowed
    /// so a flaky metrics endpoint cannot hide a finished job.
    pub fn refresh_attributes(&self, job: &mut Job) -> Result<JobStatus> {
        let status = self.refresh_status(job)?;
        if matches!(status, JobStatus::Succeeded | JobStatus::Failed) {
            if let Err(e) = self.refresh_result(job) {
                log::debug!("result fetch for job {} failed: {e}", job.id);
            }
            if let Err(e) = self.refresh_metrics(job) {
                log::debug!("metrics fetch for job {} failed: {e}", job.id);
            }
        }
        Ok(status)
    }

    /// Looks up a job by id and fills in whatever the service knows about it.
    pub fn get_job(&self, id: &str) -> Result<Job> {
        let mut job = Job::with_id(id);
        self.refresh_attributes(&mut job)?;
        Ok(job)
    }

    /// Polls until the job reaches a terminal status, sleeping with bounded
    /// exponential backoff between probes.
    ///
    /// Transport failures and non-2xx replies are retried under the same
    /// schedule; malformed or unrecognized status documents abort
    /// immediately. The terminal status is written back to `job`.
    pub fn wait_for_completion(&self, job: &mut Job) -> Result<JobStatus> {
        let job_id = job.id.clone();
        let cancel = self.cancel.as_deref();

        let status = poll::drive(
            &self.poll,
            &job_id,
            cancel,
            || match self.probe_status(&job_id) {
                Ok(status) if status.is_terminal() => Ok(Probe::Done(status)),
                Ok(status) => Ok(Probe::Pending(status)),
                Err(e) if e.is_retriable_probe_failure() => Ok(Probe::TransportError(e)),
                Err(e) => Err(e),
            },
            |delay| poll::interruptible_sleep(cancel, delay),
        )?;

        job.status = status;
        Ok(status)
    }

    /// Submits, waits for completion, and gathers results in one call.
    ///
    /// A job that could not be submitted or that finished `Failed` comes
    /// back as [`Error::JobFailed`]. Dismissed, deduped, and offline jobs
    /// are returned as-is for the caller to inspect.
    pub fn run(&self, spec: &JobSpec) -> Result<Job> {
        let mut job = self.submit_job(spec);
        if job.failed() {
            return Err(Error::JobFailed {
                details: job
                    .error_details
                    .unwrap_or_else(|| "submission failed".to_string()),
                id: job.id,
            });
        }

        self.wait_for_completion(&mut job)?;
        self.refresh_attributes(&mut job)?;

        if job.failed() {
            return Err(Error::JobFailed {
                details: job
                    .error_details
                    .unwrap_or_else(|| "no error details reported".to_string()),
                id: job.id,
            });
        }
        Ok(job)
    }

    /// Asks the service to dismiss a job. Returns the raw response body; the
    /// service answers with a short acknowledgement rather than a document.
    pub fn cancel_job(&self, id: &str) -> Result<String> {
        self.api_text("POST", &self.job_dismiss_url(id))
    }

    /// Searches granule metadata, fetching pages until `limit` results or an
    /// empty page.
    pub fn search_granules(&self, query: &SearchQuery, limit: usize) -> Result<Vec<Granule>> {
        let values = self.search_pages(&self.granule_search_url(), query, limit)?;
        Ok(values.into_iter().map(Granule::from_metadata).collect())
    }

    /// Searches collection metadata.
    pub fn search_collections(&self, query: &SearchQuery, limit: usize) -> Result<Vec<Collection>> {
        let host = host_of(&self.api_root).unwrap_or_default().to_string();
        let values = self.search_pages(&self.collection_search_url(), query, limit)?;
        Ok(values
            .into_iter()
            .map(|value| Collection::from_metadata(value, &host))
            .collect())
    }

    /// Searches granule metadata and returns the raw converted records.
    pub fn search_raw(&self, query: &SearchQuery, limit: usize) -> Result<Vec<Value>> {
        self.search_pages(&self.granule_search_url(), query, limit)
    }

    fn search_pages(&self, url: &str, query: &SearchQuery, limit: usize) -> Result<Vec<Value>> {
        let base_params = cmr::expand_query_params(query.terms());
        let mut results: Vec<Value> = Vec::new();
        let mut page_num: usize = 1;

        while results.len() < limit {
            let mut params = base_params.clone();
            params.push(("page_num".to_string(), page_num.to_string()));
            params.push(("page_size".to_string(), self.page_size.to_string()));

            let resp = self
                .http
                .get(url)
                .headers(self.api_headers()?)
                .timeout(self.timeout)
                .query(&params)
                .send()?;
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            if !status.is_success() {
                return Err(Error::Api {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body,
                });
            }

            let page = cmr::parse_search_page(&body)?;
            if page.is_empty() {
                break;
            }
            results.extend(page);
            page_num += 1;
        }

        results.truncate(limit);
        Ok(results)
    }

    /// Resolves a granule's best source and downloads it into `dest_dir`.
    ///
    /// Returns `Ok(None)` when the granule advertises no usable source.
    pub fn download_granule(
        &self,
        granule: &Granule,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<Option<PathBuf>> {
        match &granule.location {
            Some(location) => self.download(location, dest_dir, overwrite).map(Some),
            None => {
                log::warn!(
                    "granule {} advertises no downloadable source",
                    granule.granule_ur
                );
                Ok(None)
            }
        }
    }

    /// Downloads a resolved location into `dest_dir`.
    ///
    /// An existing destination is returned untouched unless `overwrite` is
    /// set. An S3 primary that fails for any reason falls back to the HTTPS
    /// mirror when one was resolved.
    pub fn download(
        &self,
        location: &Location,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let dest = dest_dir.join(&location.destination_name);
        if dest.exists() && !overwrite {
            log::debug!("{} already exists, skipping download", dest.display());
            return Ok(dest);
        }
        std::fs::create_dir_all(dest_dir)?;

        match location.primary.scheme {
            Scheme::S3 => match download::fetch_s3(&location.primary.url, &dest, self.progress) {
                Ok(path) => Ok(path),
                Err(e) => match &location.fallback {
                    Some(fallback) => {
                        log::debug!(
                            "s3 fetch of {} failed ({e}), falling back to {}",
                            location.primary.url,
                            fallback.url
                        );
                        self.fetch_over_http(&fallback.url, &dest)
                    }
                    None => Err(e),
                },
            },
            Scheme::Ftp => download::fetch_ftp(&location.primary.url, &dest, self.progress),
            Scheme::Https => self.fetch_over_http(&location.primary.url, &dest),
        }
    }

    /// Downloads a single URL into `dest_dir`, resolving scheme and
    /// destination name the same way granule downloads do.
    pub fn download_url(&self, url: &str, dest_dir: &Path, overwrite: bool) -> Result<PathBuf> {
        let candidates = [url.to_string()];
        let location = resolve_location(&candidates)
            .ok_or_else(|| Error::Config(format!("no usable download source in {url}")))?;
        self.download(&location, dest_dir, overwrite)
    }

    fn fetch_over_http(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        download::fetch_http(
            &self.http,
            &self.auth,
            &self.content_type,
            url,
            dest,
            self.progress,
        )
    }

    fn probe_status(&self, id: &str) -> Result<JobStatus> {
        let body = self.api_text("GET", &self.job_status_url(id))?;
        Ok(wps::parse_status(&body)?.status)
    }

    fn dps_job_url(&self) -> String {
        urljoin(&self.api_root, "dps/job")
    }

    fn job_status_url(&self, id: &str) -> String {
        format!("{}/{id}/status", self.dps_job_url())
    }

    fn job_result_url(&self, id: &str) -> String {
        format!("{}/{id}", self.dps_job_url())
    }

    fn job_metrics_url(&self, id: &str) -> String {
        format!("{}/{id}/metrics", self.dps_job_url())
    }

    fn job_dismiss_url(&self, id: &str) -> String {
        format!("{}/dismiss/{id}", self.dps_job_url())
    }

    fn granule_search_url(&self) -> String {
        urljoin(&self.api_root, "cmr/granules")
    }

    fn collection_search_url(&self) -> String {
        urljoin(&self.api_root, "cmr/collections")
    }

    fn api_headers(&self) -> Result<HeaderMap> {
        auth::request_headers(&self.content_type, &self.token, self.proxy_ticket.as_deref())
    }

    fn api_text(&self, method: &str, url: &str) -> Result<String> {
        let req = match method {
            "POST" => self.http.post(url),
            _ => self.http.get(url),
        };
        let resp = req
            .headers(self.api_headers()?)
            .timeout(self.timeout)
            .send()?;

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::runtime::Runtime;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::granule::DownloadCandidate;

    const TEST_JOB: &str = "50314f32-6099-47fa-8270-c378ac5ff83b";

    // The runtime is returned first so the server (and its background task)
    // drops before the runtime at the call site.
    fn mock_server() -> (Runtime, MockServer) {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        (rt, server)
    }

    fn mount(rt: &Runtime, server: &MockServer, mock: Mock) {
        rt.block_on(server.register(mock));
    }

    fn test_client(server: &MockServer) -> Client {
        Client::new(Some(server.uri()), Some("test-token".to_string()), Some(true))
            .unwrap()
            .with_progress(false)
            .with_poll_config(PollConfig {
                base_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(4),
                max_total_time: Duration::from_secs(5),
            })
    }

    fn status_doc(status: &str) -> String {
        format!(
            r#"<wps:StatusInfo xmlns:wps="http://www.opengis.net/wps/2.0"><wps:JobID>{TEST_JOB}</wps:JobID><wps:Status>{status}</wps:Status></wps:StatusInfo>"#
        )
    }

    fn result_doc() -> String {
        format!(
            r#"<wps:Result xmlns:wps="http://www.opengis.net/wps/2.0"><wps:JobID>{TEST_JOB}</wps:JobID><wps:Output id="output-2021-05-26T18:39:14"><wps:Data>http://bucket.s3-website-us-east-1.amazonaws.com/out/2021/product.tif</wps:Data><wps:Data>s3://s3.amazonaws.com:80/bucket/out/2021/product.tif</wps:Data><wps:Data>https://s3.console.aws.amazon.com/s3/buckets/bucket/out/2021/?region=us-east-1</wps:Data></wps:Output></wps:Result>"#
        )
    }

    fn failed_result_doc() -> String {
        format!(
            r#"<wps:Result xmlns:wps="http://www.opengis.net/wps/2.0" xmlns:ows="http://www.opengis.net/ows/2.0"><wps:JobID>{TEST_JOB}</wps:JobID><wps:Error><ows:ExceptionText>Traceback (most recent call last): worker ran out of memory</ows:ExceptionText></wps:Error></wps:Result>"#
        )
    }

    const METRICS_BODY: &str = "<metrics><machine_type>c5.4xlarge</machine_type><directory_size>11272048640</directory_size></metrics>";

    fn envelope(xml: &str) -> String {
        format!("\"{}\"\n", xml.replace('"', "\\\""))
    }

    fn granule_page(names: &[&str]) -> String {
        let results: String = names
            .iter()
            .map(|n| {
                format!(
                    r#"<result concept-id="G-{n}" collection-concept-id="C1200015068-NASA_MAAP"><Granule><GranuleUR>{n}</GranuleUR><OnlineAccessURLs><OnlineAccessURL><URL>https://data.example.org/{n}</URL></OnlineAccessURL></OnlineAccessURLs></Granule></result>"#
                )
            })
            .collect();
        envelope(&format!("<results><hits>9</hits>{results}</results>"))
    }

    #[test]
    fn submit_job_returns_accepted_job_on_ack() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path("/dps/job"))
                .and(header("token", "test-token"))
                .and(body_string_contains("job-plot-algo:main"))
                .and(body_string_contains("username"))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Accepted")))
                .expect(1),
        );

        let spec = JobSpec::new("plot-algo", "main").input("granule_ur", "a.h5");
        let job = client.submit_job(&spec);

        assert_eq!(job.id, TEST_JOB);
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.response_code, Some(200));
        assert!(job.error_details.is_none());
    }

    #[test]
    fn submit_job_maps_http_errors_to_failed_jobs() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path("/dps/job"))
                .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
                .expect(1),
        );

        let job = client.submit_job(&JobSpec::new("plot-algo", "main"));

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.response_code, Some(502));
        assert_eq!(job.error_details.as_deref(), Some("bad gateway"));
    }

    #[test]
    fn submit_job_maps_transport_failures_to_failed_jobs() {
        // Bind then drop a listener so the port is closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Client::new(
            Some(format!("http://127.0.0.1:{port}")),
            Some("test-token".to_string()),
            Some(true),
        )
        .unwrap()
        .with_timeout(Duration::from_secs(2));

        let job = client.submit_job(&JobSpec::new("plot-algo", "main"));

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.response_code, None);
        assert!(job.error_details.unwrap().contains("submission failed"));
    }

    #[test]
    fn submit_job_normalizes_exception_documents() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        let body = r#"<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/2.0"><ows:Exception exceptionCode="InvalidParameterValue"><ows:ExceptionText>algorithm not registered</ows:ExceptionText></ows:Exception></ows:ExceptionReport>"#;
        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path("/dps/job"))
                .respond_with(ResponseTemplate::new(200).set_body_string(body)),
        );

        let job = client.submit_job(&JobSpec::new("missing-algo", "main"));

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.response_code, Some(400));
        assert_eq!(
            job.error_details.as_deref(),
            Some("Exception: InvalidParameterValue: algorithm not registered")
        );
    }

    #[test]
    fn refresh_status_updates_status_and_id() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running")))
                .expect(1),
        );

        let mut job = Job::with_id(TEST_JOB);
        let status = client.refresh_status(&mut job).unwrap();

        assert_eq!(status, JobStatus::Running);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.id, TEST_JOB);
    }

    #[test]
    fn refresh_result_replaces_outputs_on_repeat() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(result_doc()))
                .expect(2),
        );

        let mut job = Job::with_id(TEST_JOB);
        client.refresh_result(&mut job).unwrap();
        client.refresh_result(&mut job).unwrap();

        assert_eq!(job.outputs.len(), 3);
        assert!(job.outputs[0].starts_with("http://bucket.s3-website"));
        assert!(job.outputs[1].starts_with("s3://"));
    }

    #[test]
    fn refresh_attributes_tolerates_metrics_failure() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Succeeded"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(result_doc())),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/metrics")))
                .respond_with(ResponseTemplate::new(500).set_body_string("metrics store down")),
        );

        let mut job = Job::with_id(TEST_JOB);
        let status = client.refresh_attributes(&mut job).unwrap();

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(job.outputs.len(), 3);
        assert!(job.metrics.is_empty());
    }

    #[test]
    fn refresh_attributes_skips_documents_for_running_jobs() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(result_doc()))
                .expect(0),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/metrics")))
                .respond_with(ResponseTemplate::new(200).set_body_string(METRICS_BODY))
                .expect(0),
        );

        let mut job = Job::with_id(TEST_JOB);
        let status = client.refresh_attributes(&mut job).unwrap();

        assert_eq!(status, JobStatus::Running);
        assert!(job.outputs.is_empty());
    }

    #[test]
    fn get_job_assembles_terminal_jobs() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Succeeded"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(result_doc())),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/metrics")))
                .respond_with(ResponseTemplate::new(200).set_body_string(METRICS_BODY)),
        );

        let job = client.get_job(TEST_JOB).unwrap();

        assert!(job.succeeded());
        assert_eq!(job.outputs.len(), 3);
        assert_eq!(job.metrics.machine_type.as_deref(), Some("c5.4xlarge"));
        assert_eq!(job.metrics.directory_size, Some(11_272_048_640));
    }

    #[test]
    fn cancel_job_returns_acknowledgement_body() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path(format!("/dps/job/dismiss/{TEST_JOB}")))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string("Dismissed job in queue"),
                )
                .expect(1),
        );

        let ack = client.cancel_job(TEST_JOB).unwrap();
        assert_eq!(ack, "Dismissed job in queue");
    }

    #[test]
    fn wait_for_completion_polls_until_succeeded() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running")))
                .up_to_n_times(2),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Succeeded"))),
        );

        let mut job = Job::with_id(TEST_JOB);
        let status = client.wait_for_completion(&mut job).unwrap();

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn wait_for_completion_retries_transport_errors() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
                .up_to_n_times(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Succeeded"))),
        );

        let mut job = Job::with_id(TEST_JOB);
        let status = client.wait_for_completion(&mut job).unwrap();

        assert_eq!(status, JobStatus::Succeeded);
    }

    #[test]
    fn wait_for_completion_times_out_as_poll_timeout() {
        let (rt, server) = mock_server();
        let client = test_client(&server).with_poll_config(PollConfig {
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_total_time: Duration::from_millis(10),
        });

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running"))),
        );

        let mut job = Job::with_id(TEST_JOB);
        let err = client.wait_for_completion(&mut job).unwrap_err();

        match err {
            Error::PollTimeout { id, last, .. } => {
                assert_eq!(id, TEST_JOB);
                assert_eq!(last, "status Running");
            }
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[test]
    fn wait_for_completion_rejects_unknown_statuses() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Queued")))
                .expect(1),
        );

        let mut job = Job::with_id(TEST_JOB);
        let err = client.wait_for_completion(&mut job).unwrap_err();

        assert!(matches!(err, Error::UnknownStatus(s) if s == "Queued"));
    }

    #[test]
    fn wait_for_completion_honors_preset_cancel_flag() {
        let (rt, server) = mock_server();
        let flag = Arc::new(AtomicBool::new(true));
        let client = test_client(&server).with_cancel_flag(flag);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running")))
                .expect(0),
        );

        let mut job = Job::with_id(TEST_JOB);
        let err = client.wait_for_completion(&mut job).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn cancel_flag_set_mid_wait_stops_polling() {
        let (rt, server) = mock_server();
        let flag = Arc::new(AtomicBool::new(false));
        let client = test_client(&server)
            .with_cancel_flag(flag.clone())
            .with_poll_config(PollConfig {
                base_interval: Duration::from_secs(30),
                max_interval: Duration::from_secs(30),
                max_total_time: Duration::from_secs(120),
            });

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running"))),
        );

        let setter = std::thread::spawn({
            let flag = flag.clone();
            move || {
                std::thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::Relaxed);
            }
        });

        let mut job = Job::with_id(TEST_JOB);
        let started = std::time::Instant::now();
        let err = client.wait_for_completion(&mut job).unwrap_err();
        setter.join().unwrap();

        assert!(matches!(err, Error::Cancelled));
        // Interrupted during the first 30s sleep, not after it.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn run_surfaces_failed_jobs_with_result_errors() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path("/dps/job"))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Accepted"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Failed"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(failed_result_doc())),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/metrics")))
                .respond_with(ResponseTemplate::new(200).set_body_string(METRICS_BODY)),
        );

        let err = client.run(&JobSpec::new("plot-algo", "main")).unwrap_err();

        match err {
            Error::JobFailed { id, details } => {
                assert_eq!(id, TEST_JOB);
                assert!(details.contains("worker ran out of memory"));
            }
            other => panic!("expected JobFailed, got {other:?}"),
        }
    }

    #[test]
    fn run_drives_a_job_from_submission_to_outputs() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("POST"))
                .and(path("/dps/job"))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Accepted")))
                .expect(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Running")))
                .up_to_n_times(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/status")))
                .respond_with(ResponseTemplate::new(200).set_body_string(status_doc("Succeeded"))),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(result_doc())),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path(format!("/dps/job/{TEST_JOB}/metrics")))
                .respond_with(ResponseTemplate::new(200).set_body_string(METRICS_BODY)),
        );

        let spec = JobSpec::new("plot-algo", "main")
            .input("granule_ur", "a.h5")
            .username("tester");
        let job = client.run(&spec).unwrap();

        assert!(job.succeeded());
        assert_eq!(
            job.outputs,
            vec![
                "http://bucket.s3-website-us-east-1.amazonaws.com/out/2021/product.tif",
                "s3://s3.amazonaws.com:80/bucket/out/2021/product.tif",
                "https://s3.console.aws.amazon.com/s3/buckets/bucket/out/2021/?region=us-east-1",
            ]
        );
        assert_eq!(job.metrics.machine_type.as_deref(), Some("c5.4xlarge"));
    }

    #[test]
    fn search_granules_pages_until_limit() {
        let (rt, server) = mock_server();
        let client = test_client(&server).with_page_size(2);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/granules"))
                .and(header("token", "test-token"))
                .and(query_param("page_num", "1"))
                .and(query_param("page_size", "2"))
                .and(query_param("short_name", "GEDI02_A"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string(granule_page(&["a.h5", "b.h5"])),
                )
                .expect(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/granules"))
                .and(query_param("page_num", "2"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_string(granule_page(&["c.h5", "d.h5"])),
                )
                .expect(1),
        );

        let query = SearchQuery::new().param("short_name", "GEDI02_A");
        let granules = client.search_granules(&query, 3).unwrap();

        assert_eq!(granules.len(), 3);
        assert_eq!(granules[0].granule_ur, "a.h5");
        assert_eq!(granules[2].granule_ur, "c.h5");
        assert_eq!(granules[0].collection_concept_id, "C1200015068-NASA_MAAP");
        assert!(granules[0].location.is_some());
    }

    #[test]
    fn search_granules_stops_on_an_empty_page() {
        let (rt, server) = mock_server();
        let client = test_client(&server).with_page_size(2);

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/granules"))
                .and(query_param("page_num", "1"))
                .respond_with(ResponseTemplate::new(200).set_body_string(granule_page(&["a.h5"])))
                .expect(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/granules"))
                .and(query_param("page_num", "2"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(envelope("<results><hits>1</hits></results>")),
                )
                .expect(1),
        );

        let query = SearchQuery::new().param("short_name", "GEDI02_A");
        let granules = client.search_granules(&query, 10).unwrap();

        assert_eq!(granules.len(), 1);
    }

    #[test]
    fn search_surfaces_catalog_errors() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        mount(&rt, &server,
            Mock::given(method("GET")).and(path("/cmr/granules")).respond_with(
                ResponseTemplate::new(200).set_body_string(envelope(
                    "<errors><error>Parameter [sitename] was not recognized</error></errors>",
                )),
            ),
        );

        let query = SearchQuery::new().param("sitename", "lope");
        let err = client.search_granules(&query, 5).unwrap_err();

        assert!(matches!(err, Error::Search(msg) if msg.contains("not recognized")));
    }

    #[test]
    fn search_collections_maps_metadata_records() {
        let (rt, server) = mock_server();
        let client = test_client(&server);

        let page = envelope(
            r#"<results><result concept-id="C1200015068-NASA_MAAP"><Collection><ShortName>GEDI02_A</ShortName><DataSetId>GEDI L2A</DataSetId></Collection></result></results>"#,
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/collections"))
                .and(query_param("page_num", "1"))
                .respond_with(ResponseTemplate::new(200).set_body_string(page))
                .up_to_n_times(1),
        );
        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/cmr/collections"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(envelope("<results><hits>1</hits></results>")),
                ),
        );

        let query = SearchQuery::new().param("short_name", "GEDI02_A");
        let collections = client.search_collections(&query, 5).unwrap();

        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].concept_id, "C1200015068-NASA_MAAP");
        assert_eq!(collections[0].short_name, "GEDI02_A");
        assert!(collections[0].metadata_url.contains("C1200015068-NASA_MAAP.umm-json"));
    }

    #[test]
    fn download_skips_existing_destination_without_network() {
        let (rt, server) = mock_server();
        let client = test_client(&server);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("product.tif"), b"already here").unwrap();

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/files/product.tif"))
                .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
                .expect(0),
        );

        let location = Location {
            primary: DownloadCandidate {
                scheme: Scheme::Https,
                url: format!("{}/files/product.tif", server.uri()),
            },
            fallback: None,
            destination_name: "product.tif".to_string(),
        };
        let path = client.download(&location, dir.path(), false).unwrap();

        assert_eq!(path, dir.path().join("product.tif"));
        assert_eq!(std::fs::read(&path).unwrap(), b"already here");
    }

    #[test]
    fn download_overwrites_when_asked() {
        let (rt, server) = mock_server();
        let client = test_client(&server);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("product.tif"), b"stale").unwrap();

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/files/product.tif"))
                .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
                .expect(1),
        );

        let location = Location {
            primary: DownloadCandidate {
                scheme: Scheme::Https,
                url: format!("{}/files/product.tif", server.uri()),
            },
            fallback: None,
            destination_name: "product.tif".to_string(),
        };
        let path = client.download(&location, dir.path(), true).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"fresh");
    }

    #[test]
    fn download_falls_back_to_https_when_s3_fails() {
        let (rt, server) = mock_server();
        let client = test_client(&server);
        let dir = tempfile::tempdir().unwrap();

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/files/product.tif"))
                .respond_with(ResponseTemplate::new(200).set_body_string("mirrored bytes"))
                .expect(1),
        );

        // A keyless S3 URL fails before any request is made.
        let location = Location {
            primary: DownloadCandidate {
                scheme: Scheme::S3,
                url: "s3://bucket-without-key".to_string(),
            },
            fallback: Some(DownloadCandidate {
                scheme: Scheme::Https,
                url: format!("{}/files/product.tif", server.uri()),
            }),
            destination_name: "product.tif".to_string(),
        };
        let path = client.download(&location, dir.path(), false).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "mirrored bytes");
    }

    #[test]
    fn download_url_resolves_name_and_fetches() {
        let (rt, server) = mock_server();
        let client = test_client(&server);
        let dir = tempfile::tempdir().unwrap();

        mount(&rt, &server,
            Mock::given(method("GET"))
                .and(path("/data/2021/scene.h5"))
                .respond_with(ResponseTemplate::new(200).set_body_string("granule bytes"))
                .expect(1),
        );

        let url = format!("{}/data/2021/scene.h5", server.uri());
        let path = client.download_url(&url, dir.path(), false).unwrap();

        assert_eq!(path, dir.path().join("scene.h5"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "granule bytes");
    }

    #[test]
    fn download_granule_without_sources_returns_none() {
        let (_rt, server) = mock_server();
        let client = test_client(&server);
        let dir = tempfile::tempdir().unwrap();

        let granule = Granule::from_metadata(serde_json::json!({
            "concept-id": "G-empty",
            "Granule": { "GranuleUR": "empty.h5" }
        }));
        let downloaded = client.download_granule(&granule, dir.path(), false).unwrap();

        assert!(downloaded.is_none());
    }
}
