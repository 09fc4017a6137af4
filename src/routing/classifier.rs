//! Per-request proxy classification.
//!
//! # Responsibilities
//! - Skip non-GET/POST requests and do-not-proxy prefixes (cheap, first)
//! - Forward direct-proxy prefixes verbatim to the upstream host
//! - Rewrite everything else into a layout service request
//!
//! # Design Decisions
//! - Prefix checks run against path + query, case-insensitively
//! - Transformed requests keep the incoming query string and then set
//!   `item`, `sc_apikey`, `sc_site` and (when known) `sc_lang`
//! - Unmatched app routes resolve to `/` (see `RouteTable::resolve`)

use axum::http::{Method, Uri};
use url::{form_urlencoded, Url};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::routing::matcher::{Matcher, PathPrefixMatcher, PrefixList};
use crate::routing::router::{PatternError, ResolvedRoute, RouteTable};

pub const ITEM_PARAM: &str = "item";
pub const API_KEY_PARAM: &str = "sc_apikey";
pub const SITE_PARAM: &str = "sc_site";
pub const LANGUAGE_PARAM: &str = "sc_lang";

/// Why a request bypasses the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Method(Method),
    DoNotProxy(String),
}

/// Outcome of classifying one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Hand the request to the next middleware untouched.
    Skip(SkipReason),
    /// Forward to the upstream host with path and query unchanged.
    DirectProxy { target: Url, is_layout_service: bool },
    /// Rewrite into a layout service request for the resolved route.
    Transform { target: Url, route: ResolvedRoute },
}

impl Classification {
    /// Label used for logs and metrics.
    pub fn mode(&self) -> &'static str {
        match self {
            Classification::Skip(_) => "skip",
            Classification::DirectProxy { .. } => "direct",
            Classification::Transform { .. } => "transform",
        }
    }
}

/// Decides, per request, how the proxy treats it.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    do_not_proxy: PrefixList,
    direct_proxy: PrefixList,
    layout_service: PathPrefixMatcher,
    routes: RouteTable,
    api_host: String,
    api_key: String,
    site_name: String,
    layout_render_path: String,
}

impl RouteClassifier {
    /// Compile classification rules from configuration.
    pub fn from_config(config: &ProxyConfig) -> std::result::Result<Self, PatternError> {
        Ok(Self {
            do_not_proxy: PrefixList::new(config.proxy.all_do_not_proxy_prefixes()),
            direct_proxy: PrefixList::new(config.proxy.all_direct_proxy_prefixes()),
            layout_service: PathPrefixMatcher::new(config.sitecore.layout_service_prefix.clone()),
            routes: RouteTable::from_patterns(&config.proxy.route_patterns)?,
            api_host: config.sitecore.api_host.trim_end_matches('/').to_string(),
            api_key: config.sitecore.api_key.clone(),
            site_name: config.sitecore.site_name.clone(),
            layout_render_path: config.sitecore.layout_render_path.clone(),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Classify a request by method and target.
    pub fn classify(&self, method: &Method, uri: &Uri) -> Result<Classification> {
        if method != Method::GET && method != Method::POST {
            return Ok(Classification::Skip(SkipReason::Method(method.clone())));
        }

        let request_target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());

        if let Some(prefix) = self.do_not_proxy.first_match(request_target) {
            return Ok(Classification::Skip(SkipReason::DoNotProxy(prefix.to_string())));
        }

        if self.direct_proxy.matches(request_target) {
            let target = self.parse_target(format!("{}{}", self.api_host, request_target))?;
            return Ok(Classification::DirectProxy {
                target,
                is_layout_service: self.layout_service.matches(request_target),
            });
        }

        let route = self.routes.resolve(uri.path());
        let query = self.layout_service_query(uri.query(), &route);
        let target = self.parse_target(format!(
            "{}{}?{}",
            self.api_host, self.layout_render_path, query
        ))?;
        Ok(Classification::Transform { target, route })
    }

    fn layout_service_query(&self, incoming: Option<&str>, route: &ResolvedRoute) -> String {
        let mut params: Vec<(String, String)> = incoming
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        set_param(&mut params, ITEM_PARAM, &route.sitecore_route);
        set_param(&mut params, API_KEY_PARAM, &self.api_key);
        set_param(&mut params, SITE_PARAM, &self.site_name);
        if let Some(language) = &route.language {
            set_param(&mut params, LANGUAGE_PARAM, language);
        }

        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish()
    }

    fn parse_target(&self, raw: String) -> Result<Url> {
        Url::parse(&raw).map_err(|e| ProxyError::InvalidTarget {
            target: raw,
            reason: e.to_string(),
        })
    }
}

/// Replace the first `key` in place (dropping later duplicates) or append it.
fn set_param(params: &mut Vec<(String, String)>, key: &str, value: &str) {
    let mut found = false;
    params.retain_mut(|(k, v)| {
        if k != key {
            return true;
        }
        if found {
            return false;
        }
        found = true;
        *v = value.to_string();
        true
    });
    if !found {
        params.push((key.to_string(), value.to_string()));
    }
}
