/// Working-directory state of a client session.
///
/// `cwd` always starts and ends with "/".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    base_url: String,
    base_path: String,
    cwd: String,
}

impl PathResolver {
    pub fn new(base_url: &str, base_path: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            base_path: base_path.trim_end_matches('/').to_string(),
            cwd: "/".to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Resolves an operation path into a request URL.
    ///
    /// Absolute paths are taken from the base URL, relative ones from the
    /// current working directory.
    pub fn resolve(&self, path: &str) -> String {
        let path = path.trim();
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}{}", self.base_url, self.cwd, path)
        }
    }

    /// Changes the working directory. Empty input is a no-op.
    pub fn change_directory(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let stripped = format!("{}/", segments.join("/"));

        if stripped == "/" {
            self.cwd = stripped;
        } else if path.starts_with('/') {
            self.cwd = format!("/{}", stripped);
        } else {
            self.cwd.push_str(&stripped);
        }
    }
}
