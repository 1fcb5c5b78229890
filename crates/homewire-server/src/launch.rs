//! Per-connection launch context: request capture, script lookup and the
//! CGI-style environment handed to child processes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use homewire_types::HubError;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Interface name advertised in `GATEWAY_INTERFACE`.
pub const GATEWAY_INTERFACE: &str = "websocketd-CGI/0.1";

/// What the upgrade request told us about the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: String,
    pub remote: SocketAddr,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// Capture the parts of an upgrade request a child process may see.
    /// Header values that are not valid UTF-8 are skipped.
    pub fn capture(id: &str, remote: SocketAddr, request: &Request) -> Self {
        let headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        Self {
            id: id.to_string(),
            remote,
            path: request.uri().path().to_string(),
            query: request.uri().query().unwrap_or_default().to_string(),
            headers,
        }
    }

    /// Path plus query string, as the client sent it.
    pub fn request_uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// How a request path maps onto something to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlInfo {
    pub script_name: String,
    pub path_info: String,
    /// The script to execute; `None` when a fixed command serves every path.
    pub file_path: Option<PathBuf>,
}

/// Map `path` onto a script under `script_dir`.
///
/// Segments are walked from the left.  Directories are descended; the first
/// regular file is the script and whatever follows becomes `PATH_INFO`.
/// Without a script directory every path maps to `/` with the whole path as
/// `PATH_INFO`.
///
/// # Errors
///
/// [`HubError::ScriptNotFound`] when a segment does not exist, when the path
/// ends on a directory, or when a segment is `..`.
pub fn resolve_script(path: &str, script_dir: Option<&Path>) -> Result<UrlInfo, HubError> {
    let Some(dir) = script_dir else {
        return Ok(UrlInfo {
            script_name: "/".to_string(),
            path_info: path.to_string(),
            file_path: None,
        });
    };

    let not_found = || HubError::ScriptNotFound(path.to_string());
    let parts: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();
    let mut script_name = String::new();
    let mut file_path = dir.to_path_buf();

    for (i, part) in parts.iter().enumerate() {
        if *part == ".." {
            return Err(not_found());
        }
        script_name.push('/');
        script_name.push_str(part);
        file_path.push(part);

        let meta = std::fs::metadata(&file_path).map_err(|_| not_found())?;
        let last = i + 1 == parts.len();
        if meta.is_dir() {
            if last {
                return Err(not_found());
            }
            continue;
        }

        let path_info = if last {
            String::new()
        } else {
            format!("/{}", parts[i + 1..].join("/"))
        };
        return Ok(UrlInfo {
            script_name,
            path_info,
            file_path: Some(file_path),
        });
    }
    Err(not_found())
}

/// Copy the named variables from this process's environment.  Unset names
/// are skipped.
pub fn inherited_env(names: &[String]) -> Vec<(String, String)> {
    names
        .iter()
        .filter_map(|name| Some((name.clone(), std::env::var(name).ok()?)))
        .collect()
}

/// The complete environment for a child serving `request`.
pub fn build_env(
    request: &RequestInfo,
    url: &UrlInfo,
    server_port: u16,
    inherited: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let remote_addr = request.remote.ip().to_string();
    let mut env = vec![
        ("SERVER_SOFTWARE".to_string(), format!("homewire/{}", env!("CARGO_PKG_VERSION"))),
        ("GATEWAY_INTERFACE".to_string(), GATEWAY_INTERFACE.to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("SERVER_PORT".to_string(), server_port.to_string()),
        ("REQUEST_METHOD".to_string(), "GET".to_string()),
        ("REMOTE_ADDR".to_string(), remote_addr.clone()),
        ("REMOTE_HOST".to_string(), remote_addr),
        ("REMOTE_PORT".to_string(), request.remote.port().to_string()),
        ("SCRIPT_NAME".to_string(), url.script_name.clone()),
        ("PATH_INFO".to_string(), url.path_info.clone()),
        ("QUERY_STRING".to_string(), request.query.clone()),
        ("REQUEST_URI".to_string(), request.request_uri()),
        ("UNIQUE_ID".to_string(), request.id.clone()),
    ];
    env.extend(
        request
            .headers
            .iter()
            .map(|(name, value)| (format!("HTTP_{}", name.to_uppercase().replace('-', "_")), value.clone())),
    );
    env.extend(inherited);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(path: &str, query: &str) -> RequestInfo {
        RequestInfo {
            id: "id-1".to_string(),
            remote: "10.0.0.7:51000".parse().unwrap(),
            path: path.to_string(),
            query: query.to_string(),
            headers: vec![
                ("user-agent".to_string(), "lamp-app/1".to_string()),
                ("x-device-serial".to_string(), "X1".to_string()),
            ],
        }
    }

    fn lookup<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn fixed_command_maps_whole_path_to_path_info() {
        let url = resolve_script("/a/b", None).unwrap();
        assert_eq!(url.script_name, "/");
        assert_eq!(url.path_info, "/a/b");
        assert_eq!(url.file_path, None);
    }

    #[test]
    fn script_dir_resolves_file_and_trailing_path_info() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin").join("lamp.sh"), "#!/bin/sh\n").unwrap();

        let url = resolve_script("/bin/lamp.sh/on/now", Some(dir.path())).unwrap();
        assert_eq!(url.script_name, "/bin/lamp.sh");
        assert_eq!(url.path_info, "/on/now");
        assert_eq!(url.file_path, Some(dir.path().join("bin").join("lamp.sh")));

        let exact = resolve_script("/bin/lamp.sh", Some(dir.path())).unwrap();
        assert_eq!(exact.path_info, "");
    }

    #[test]
    fn script_dir_rejects_missing_directory_and_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("bin")).unwrap();

        for path in ["/missing.sh", "/bin", "/", "/../etc/passwd"] {
            assert_eq!(
                resolve_script(path, Some(dir.path())),
                Err(HubError::ScriptNotFound(path.to_string())),
                "{path}"
            );
        }
    }

    #[test]
    fn environment_carries_cgi_variables() {
        let req = request("/lamp", "room=kitchen");
        let url = resolve_script(&req.path, None).unwrap();
        let env = build_env(&req, &url, 8080, vec![("PATH".to_string(), "/bin".to_string())]);

        assert_eq!(lookup(&env, "GATEWAY_INTERFACE"), Some(GATEWAY_INTERFACE));
        assert_eq!(lookup(&env, "SERVER_PORT"), Some("8080"));
        assert_eq!(lookup(&env, "REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(lookup(&env, "REMOTE_HOST"), Some("10.0.0.7"));
        assert_eq!(lookup(&env, "REMOTE_PORT"), Some("51000"));
        assert_eq!(lookup(&env, "SCRIPT_NAME"), Some("/"));
        assert_eq!(lookup(&env, "PATH_INFO"), Some("/lamp"));
        assert_eq!(lookup(&env, "QUERY_STRING"), Some("room=kitchen"));
        assert_eq!(lookup(&env, "REQUEST_URI"), Some("/lamp?room=kitchen"));
        assert_eq!(lookup(&env, "UNIQUE_ID"), Some("id-1"));
        assert_eq!(lookup(&env, "HTTP_USER_AGENT"), Some("lamp-app/1"));
        assert_eq!(lookup(&env, "HTTP_X_DEVICE_SERIAL"), Some("X1"));
        assert_eq!(lookup(&env, "PATH"), Some("/bin"));
        assert!(lookup(&env, "SERVER_SOFTWARE").unwrap().starts_with("homewire/"));
    }

    #[test]
    fn request_uri_omits_empty_query() {
        assert_eq!(request("/x", "").request_uri(), "/x");
    }

    #[test]
    fn inherited_env_skips_unset_names() {
        let env = inherited_env(&["HOMEWIRE_SURELY_UNSET_VARIABLE".to_string()]);
        assert!(env.is_empty());
    }
}
