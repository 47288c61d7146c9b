//! Per-request routing: which bucket, which strategy, or no interception.

use reqwest::{Method, Url};

use crate::config::WorkerConfig;
use crate::http::{Destination, HttpRequest};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "gif", "webp", "ico"];
const ASSET_EXTENSIONS: &[&str] = &["css", "js", "woff", "woff2", "ttf", "eot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BucketKind {
    /// Application shell, pre-populated at install and never trimmed.
    Shell,
    Runtime,
    Api,
    Image,
}

impl BucketKind {
    pub const ALL: [BucketKind; 4] = [
        BucketKind::Shell,
        BucketKind::Runtime,
        BucketKind::Api,
        BucketKind::Image,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BucketKind::Shell => "shell",
            BucketKind::Runtime => "runtime",
            BucketKind::Api => "api",
            BucketKind::Image => "images",
        }
    }

    /// Versioned bucket name, e.g. `fieldcache-api-v2`.
    pub fn bucket_name(&self, config: &WorkerConfig) -> String {
        format!("{}-{}-{}", config.bucket_prefix, self.label(), config.version)
    }

    pub fn ceiling(&self, config: &WorkerConfig) -> Option<usize> {
        match self {
            BucketKind::Shell => None,
            BucketKind::Runtime => Some(config.limits.runtime),
            BucketKind::Api => Some(config.limits.api),
            BucketKind::Image => Some(config.limits.image),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; goes straight to the network.
    Passthrough,
    Intercept { bucket: BucketKind, strategy: Strategy },
}

fn host_matches(host: &str, suffix: &str) -> bool {
    host == suffix
        || host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.'))
}

fn extension(url: &Url) -> Option<String> {
    let last = url.path().rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

pub struct Router {
    origin: Option<Url>,
    api_hosts: Vec<String>,
    static_hosts: Vec<String>,
}

impl Router {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            origin: Url::parse(&config.origin).ok(),
            api_hosts: config.api_hosts.clone(),
            static_hosts: config.static_hosts.clone(),
        }
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        self.origin
            .as_ref()
            .is_some_and(|origin| origin.origin() == url.origin())
    }

    fn is_api_host(&self, host: &str) -> bool {
        self.api_hosts.iter().any(|suffix| host_matches(host, suffix))
    }

    fn is_static_host(&self, host: &str) -> bool {
        self.static_hosts.iter().any(|suffix| host_matches(host, suffix))
    }

    pub fn route(&self, request: &HttpRequest) -> Route {
        if request.method != Method::GET {
            return Route::Passthrough;
        }
        let host = request.url.host_str().unwrap_or_default();
        let api = self.is_api_host(host);
        if !api && !self.is_same_origin(&request.url) && !self.is_static_host(host) {
            return Route::Passthrough;
        }

        let ext = extension(&request.url);
        let ext_in = |list: &[&str]| ext.as_deref().is_some_and(|e| list.contains(&e));
        let image = request.destination == Destination::Image || ext_in(IMAGE_EXTENSIONS);

        let bucket = if api {
            BucketKind::Api
        } else if image {
            BucketKind::Image
        } else {
            BucketKind::Runtime
        };

        let strategy = if api {
            Strategy::NetworkFirst
        } else if image {
            Strategy::CacheFirst
        } else if matches!(
            request.destination,
            Destination::Style | Destination::Script | Destination::Font
        ) || ext_in(ASSET_EXTENSIONS)
        {
            Strategy::StaleWhileRevalidate
        } else {
            Strategy::NetworkFirst
        };

        Route::Intercept { bucket, strategy }
    }
}
