pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// When the locale segment is prefixed onto a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocalePrefix {
    #[default]
    Always,
    /// Every locale but the default one is prefixed.
    AsNeeded,
    Never,
}

impl LocalePrefix {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "always" => Some(Self::Always),
            "as_needed" => Some(Self::AsNeeded),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Resolves the login route for the page the user is currently on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleRouting {
    /// Supported locale tags; empty means routes are not localized.
    pub locales: Vec<String>,
    pub default_locale: Option<String>,
    pub login_path: String,
    pub prefix: LocalePrefix,
}

impl Default for LocaleRouting {
    fn default() -> Self {
        Self {
            locales: Vec::new(),
            default_locale: None,
            login_path: DEFAULT_LOGIN_ROUTE.to_string(),
            prefix: LocalePrefix::Always,
        }
    }
}

impl LocaleRouting {
    #[must_use]
    pub fn localized(locales: &[&str], default_locale: &str) -> Self {
        Self {
            locales: locales.iter().map(|locale| (*locale).to_string()).collect(),
            default_locale: Some(default_locale.to_string()),
            ..Self::default()
        }
    }

    fn supported(&self, candidate: &str) -> Option<&str> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return None;
        }
        if let Some(exact) = self
            .locales
            .iter()
            .find(|locale| locale.eq_ignore_ascii_case(candidate))
        {
            return Some(exact.as_str());
        }
        let primary = candidate.split(['-', '_']).next().unwrap_or(candidate);
        self.locales
            .iter()
            .find(|locale| locale.eq_ignore_ascii_case(primary))
            .map(String::as_str)
    }

    /// Locale carried by the first segment of `path`, if supported.
    #[must_use]
    pub fn locale_from_path(&self, path: &str) -> Option<&str> {
        let segment = path.trim_start_matches('/').split('/').next()?;
        self.locales
            .iter()
            .find(|locale| locale.eq_ignore_ascii_case(segment))
            .map(String::as_str)
    }

    /// Path segment, then document language, then the configured default.
    #[must_use]
    pub fn resolve_locale(&self, current_path: &str, document_lang: Option<&str>) -> Option<&str> {
        if self.locales.is_empty() {
            return None;
        }
        self.locale_from_path(current_path)
            .or_else(|| document_lang.and_then(|lang| self.supported(lang)))
            .or_else(|| {
                self.default_locale
                    .as_deref()
                    .and_then(|locale| self.supported(locale))
            })
    }

    fn route_for(&self, locale: Option<&str>) -> String {
        let login_path = normalize_path(&self.login_path);
        let prefixed = match (locale, self.prefix) {
            (None, _) | (Some(_), LocalePrefix::Never) => None,
            (Some(locale), LocalePrefix::AsNeeded)
                if self
                    .default_locale
                    .as_deref()
                    .is_some_and(|default| default.eq_ignore_ascii_case(locale)) =>
            {
                None
            }
            (Some(locale), _) => Some(locale),
        };
        match prefixed {
            Some(locale) => format!("/{locale}{login_path}"),
            None => login_path,
        }
    }

    #[must_use]
    pub fn resolve_login_route(&self, current_path: &str, document_lang: Option<&str>) -> String {
        self.route_for(self.resolve_locale(current_path, document_lang))
    }

    /// Whether `path` is, or sits under, the plain or localized login route.
    #[must_use]
    pub fn is_login_pathname(&self, path: &str, document_lang: Option<&str>) -> bool {
        let path = normalize_path(path);
        let plain = normalize_path(&self.login_path);
        let localized = self.resolve_login_route(&path, document_lang);
        [plain, localized]
            .iter()
            .any(|route| path == *route || path.starts_with(&format!("{route}/")))
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default().trim();
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
