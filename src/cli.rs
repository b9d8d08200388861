use clap::Parser;

use crate::config::ZipConfig;

#[derive(Parser, Debug)]
#[command(name = "pages-vfs")]
#[command(version)]
#[command(about = "Serve files of a static site from a directory or a remote ZIP archive", long_about = None)]
#[command(after_help = "Examples:\n  \
  pages-vfs ./site/public /docs/                     serve /docs/ from a directory\n  \
  pages-vfs -l https://example.com/site.zip          list the public/ entries of a remote archive\n  \
  pages-vfs -v file:///srv/site.zip /index.html      print status and headers to stderr")]
pub struct Cli {
    /// Site directory, or http(s):// or file:// URL of a site archive
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Request path to serve, optionally with a query string
    #[arg(value_name = "PATH", default_value = "/")]
    pub path: String,

    /// List the archive's public/ entries
    #[arg(short = 'l')]
    pub list: bool,

    /// Print response status and headers (or entry details with -l) to stderr
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Cache key of the archive (default: the archive URL)
    #[arg(long = "cache-key", value_name = "KEY")]
    pub cache_key: Option<String>,

    /// Accept-Encoding header sent with the request
    #[arg(long = "accept-encoding", value_name = "ENCODINGS")]
    pub accept_encoding: Option<String>,

    /// Range header sent with the request
    #[arg(long = "range", value_name = "RANGE")]
    pub range: Option<String>,

    /// Send a HEAD request instead of GET
    #[arg(long = "head")]
    pub head: bool,

    #[command(flatten)]
    pub zip: ZipConfig,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }

    pub fn is_archive(&self) -> bool {
        self.is_http_url() || self.source.starts_with("file://")
    }

    pub fn cache_key(&self) -> String {
        self.cache_key.clone().unwrap_or_else(|| self.source.clone())
    }

    /// Splits PATH into the URL path and the query string.
    pub fn url_path(&self) -> (String, Option<String>) {
        let (path, query) = match self.path.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (self.path.as_str(), None),
        };

        if path.starts_with('/') {
            (path.to_string(), query)
        } else {
            (format!("/{path}"), query)
        }
    }
}
