use crate::cache::CacheLayout;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Externally visible base URL that proxied links are built on
    pub proxy_base_url: String,
    pub is_dev: bool,
    pub work_dir: PathBuf,
    /// Root of the artifact cache tree
    pub cache_dir: PathBuf,
    /// SQLite database holding links, metadata and settings
    pub db_path: PathBuf,
    /// Simple-index URL template, project substituted for `%s` or `{project}`
    pub remote_index_simple: String,
    /// JSON metadata URL template
    pub remote_index_json: String,
    pub connect_timeout: Duration,
    /// Longest allowed stall while reading an upstream body
    pub download_timeout: Duration,
    /// Attempts per upstream fetch
    pub max_retries: u32,
    /// Path segment marking proxied download URLs
    pub download_endpoint: String,
    pub cache_layout: CacheLayout,
    /// Optional log file, in addition to stdout
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and PROXY_BASE_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let listen_ip: IpAddr = env::var("LISTEN_IP")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .parse()?;

        // Port: required in prod, defaults to 2222 in dev
        let port: u16 = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "2222".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Proxy base URL: required in prod, defaults to loopback in dev
        let proxy_base_url = if is_dev {
            env::var("PROXY_BASE_URL").unwrap_or_else(|_| format!("http://127.0.0.1:{port}"))
        } else {
            env::var("PROXY_BASE_URL").map_err(|_| "PROXY_BASE_URL is required in production")?
        };
        url::Url::parse(&proxy_base_url)
            .map_err(|e| format!("PROXY_BASE_URL is not a valid URL: {e}"))?;
        let proxy_base_url = proxy_base_url.trim_end_matches('/').to_string();

        let work_dir = PathBuf::from(env::var("WORKDIR").unwrap_or_else(|_| ".".to_string()));
        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("cache"));
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("remote_index.sqlite"));

        let remote_index_simple = env::var("REMOTE_INDEX_SIMPLE")
            .unwrap_or_else(|_| "https://pypi.org/simple/%s/".to_string());
        let remote_index_json = env::var("REMOTE_INDEX_JSON")
            .unwrap_or_else(|_| "https://pypi.org/pypi/%s/json".to_string());

        let connect_timeout = Duration::from_secs(
            env::var("CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
        );
        let download_timeout = Duration::from_secs(
            env::var("DOWNLOAD_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
        );
        let max_retries: u32 = env::var("MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let download_endpoint = env::var("DOWNLOAD_ENDPOINT")
            .unwrap_or_else(|_| "download_file".to_string())
            .trim_matches('/')
            .to_string();
        if download_endpoint.is_empty() || download_endpoint.contains('/') {
            return Err("DOWNLOAD_ENDPOINT must be a single path segment".into());
        }

        let cache_layout: CacheLayout = env::var("CACHE_LAYOUT")
            .unwrap_or_else(|_| "origin".to_string())
            .parse()?;

        let log_file = env::var("LOG_FILE").ok().map(PathBuf::from);

        Ok(Config {
            listen_ip,
            port,
            proxy_base_url,
            is_dev,
            work_dir,
            cache_dir,
            db_path,
            remote_index_simple,
            remote_index_json,
            connect_timeout,
            download_timeout,
            max_retries: max_retries.max(1),
            download_endpoint,
            cache_layout,
            log_file,
        })
    }
}
