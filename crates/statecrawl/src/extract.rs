//! Endpoint extraction from recorded responses
//!
//! Walks every interaction the extractor has not seen yet, parses the
//! response body as HTML and turns anchors, forms and redirects into
//! candidate endpoints. Candidates resolve relative to the interaction's own
//! endpoint; with host restriction on (the default), anything pointing off
//! the target host is dropped.

use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::config::CrawlerConfig;
use crate::error::Result;
use crate::hashing::HashContext;
use crate::model::{Endpoint, Interaction, Parameter};
use crate::store::Store;

/// Locator marker for endpoints found in a response header.
const HEADER_LOCATOR: &str = "[header]";

/// Parses responses into candidate endpoints.
pub struct EndpointExtractor {
    store: Arc<dyn Store>,
    ctx: Arc<HashContext>,
    restrict_host: bool,
    ignore_paths: Vec<String>,
}

impl EndpointExtractor {
    /// Build an extractor. The configured reset path is always ignored so
    /// navigation resets never re-enter the endpoint pool.
    pub fn new(store: Arc<dyn Store>, ctx: Arc<HashContext>, config: &CrawlerConfig) -> Self {
        let mut ignore_paths = config.ignore_paths.clone();
        if !ignore_paths.contains(&config.reset_path) {
            ignore_paths.push(config.reset_path.clone());
        }
        Self {
            store,
            ctx,
            restrict_host: config.restrict_host,
            ignore_paths,
        }
    }

    /// Process every interaction with `endpoints_processed == false`.
    pub async fn process(&self) -> Result<()> {
        for interaction in self.store.unprocessed_interactions().await? {
            let endpoints = self.find_endpoints(&interaction);
            let kept: Vec<Endpoint> = endpoints
                .into_iter()
                .filter(|e| !self.ignore_paths.contains(&e.path))
                .collect();
            let added = kept.len();

            self.store.insert_endpoints(kept).await?;
            self.store
                .set_interaction_endpoints_processed(&interaction.id)
                .await?;
            info!(
                interaction_id = %interaction.id,
                added,
                "processed interaction"
            );
        }
        Ok(())
    }

    /// All candidate endpoints in one interaction's response.
    fn find_endpoints(&self, interaction: &Interaction) -> Vec<Endpoint> {
        let source = &interaction.request.endpoint;
        let Ok(base) = Url::parse(&source.url()) else {
            debug!(endpoint = %source, "source endpoint is not a valid URL");
            return Vec::new();
        };

        let mut endpoints = Vec::new();
        self.find_redirect(interaction, &base, &mut endpoints);

        let document = Html::parse_document(&interaction.response.data);
        self.find_links(interaction, &document, &base, &mut endpoints);
        self.find_forms(interaction, &document, &base, &mut endpoints);
        endpoints
    }

    #[allow(clippy::unwrap_used)] // static selector
    fn find_links(
        &self,
        interaction: &Interaction,
        document: &Html,
        base: &Url,
        out: &mut Vec<Endpoint>,
    ) {
        let selector = Selector::parse("a[href]").unwrap();
        for anchor in document.select(&selector) {
            let href = anchor.value().attr("href").unwrap_or_default();
            let Some(target) = self.resolve(href, base) else {
                continue;
            };
            out.push(
                Endpoint::builder(
                    netloc(&target),
                    target.path(),
                    interaction.state_id.as_str(),
                    interaction.id.as_str(),
                )
                .scheme(target.scheme())
                .parameters(Parameter::parse_query(target.query().unwrap_or_default()))
                .found_at(locator_path(&anchor))
                .build(&self.ctx),
            );
        }
    }

    #[allow(clippy::unwrap_used)] // static selectors
    fn find_forms(
        &self,
        interaction: &Interaction,
        document: &Html,
        base: &Url,
        out: &mut Vec<Endpoint>,
    ) {
        let form_selector = Selector::parse("form").unwrap();
        let field_selector = Selector::parse("input, button").unwrap();

        for form in document.select(&form_selector) {
            // A missing action submits back to the source URL.
            let action = form.value().attr("action").unwrap_or_default();
            let Some(target) = self.resolve(action, base) else {
                continue;
            };

            let mut fields: Vec<Parameter> = Vec::new();
            for field in form.select(&field_selector) {
                if let Some(name) = field.value().attr("name") {
                    let value = field.value().attr("value").unwrap_or_default();
                    let parameter = Parameter::new(name, value);
                    if !fields.contains(&parameter) {
                        fields.push(parameter);
                    }
                }
            }

            let method = form
                .value()
                .attr("method")
                .unwrap_or("GET")
                .to_ascii_uppercase();

            let builder = Endpoint::builder(
                netloc(&target),
                target.path(),
                interaction.state_id.as_str(),
                interaction.id.as_str(),
            )
            .scheme(target.scheme())
            .method(method.as_str())
            .found_at(locator_path(&form));

            // GET forms submit their fields as a query string; anything else
            // sends them as a body (RFC 7231 gives a GET body no semantics).
            let builder = if method == "GET" {
                builder.parameters(fields)
            } else {
                builder.data(fields)
            };
            out.push(builder.build(&self.ctx));
        }
    }

    fn find_redirect(&self, interaction: &Interaction, base: &Url, out: &mut Vec<Endpoint>) {
        let response = &interaction.response;
        if !response.is_redirect() {
            return;
        }
        let Some(location) = response.header("location") else {
            return;
        };
        let Some(target) = self.resolve(location, base) else {
            return;
        };
        out.push(
            Endpoint::builder(
                netloc(&target),
                target.path(),
                interaction.state_id.as_str(),
                interaction.id.as_str(),
            )
            .scheme(target.scheme())
            .parameters(Parameter::parse_query(target.query().unwrap_or_default()))
            .found_at(vec![HEADER_LOCATOR.to_string(), response.code.to_string()])
            .build(&self.ctx),
        );
    }

    /// Resolve a raw href against the base URL, applying host restriction.
    fn resolve(&self, raw: &str, base: &Url) -> Option<Url> {
        let target = base.join(raw).ok()?;
        if self.restrict_host && target.host_str() != base.host_str() {
            return None;
        }
        if self.restrict_host && target.port() != base.port() {
            return None;
        }
        Some(target)
    }
}

/// Host plus any explicit port, as it appears in an endpoint's `host` field.
fn netloc(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Root-first chain of ancestor element names: a stable DOM locator.
fn locator_path(element: &ElementRef<'_>) -> Vec<String> {
    let mut names: Vec<String> = element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .map(|el| el.value().name().to_string())
        .collect();
    names.reverse();
    names
}
