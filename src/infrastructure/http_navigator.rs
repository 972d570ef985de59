//! HTTP-backed Navigator
//!
//! FMCSA 페이지는 서버 렌더링 HTML 폼이라 브라우저 없이도 동작한다.
//! Each launched "browser" is a `reqwest::Client` with its own cookie jar, so
//! batches never share session state. Pages parse the current document with
//! `scraper` on demand and replay form submissions (hidden fields included).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use super::navigator::{Browser, BrowserLauncher, NavigationError, Page};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// HTTP navigator configuration
#[derive(Debug, Clone)]
pub struct HttpNavigatorConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for HttpNavigatorConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

pub struct HttpLauncher {
    config: HttpNavigatorConfig,
}

impl HttpLauncher {
    #[must_use]
    pub const fn new(config: HttpNavigatorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for HttpLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, NavigationError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|e| NavigationError::Launch(format!("invalid user agent: {e}")))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .timeout(self.config.request_timeout)
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| NavigationError::Launch(e.to_string()))?;

        Ok(Arc::new(HttpBrowser { client }))
    }
}

pub struct HttpBrowser {
    client: Client,
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>, NavigationError> {
        Ok(Box::new(HttpPage::new(self.client.clone())))
    }
}

pub struct HttpPage {
    client: Client,
    url: Option<Url>,
    html: Option<String>,
    /// Pending form values by control name, applied on the next submit
    overrides: Vec<(String, String)>,
}

impl HttpPage {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            url: None,
            html: None,
            overrides: Vec::new(),
        }
    }

    fn document(&self) -> Result<&str, NavigationError> {
        self.html.as_deref().ok_or(NavigationError::NoDocument)
    }

    fn set_override(&mut self, name: String, value: String) {
        self.overrides.retain(|(n, _)| *n != name);
        self.overrides.push((name, value));
    }

    async fn load(&mut self, request: reqwest::RequestBuilder, target: &str) -> Result<(), NavigationError> {
        let response = request.send().await.map_err(|e| request_error(target, &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NavigationError::Http {
                status: status.as_u16(),
                url: target.to_string(),
            });
        }
        let final_url = response.url().clone();
        let body = response.text().await.map_err(|e| request_error(target, &e))?;

        debug!("Loaded {} ({} bytes)", final_url, body.len());
        self.url = Some(final_url);
        self.html = Some(body);
        self.overrides.clear();
        Ok(())
    }
}

fn request_error(url: &str, e: &reqwest::Error) -> NavigationError {
    NavigationError::Request {
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn parse_selector(selector: &str) -> Result<Selector, NavigationError> {
    Selector::parse(selector).map_err(|_| NavigationError::InvalidSelector {
        selector: selector.to_string(),
    })
}

fn find_first<'a>(doc: &'a Html, selector: &str) -> Result<ElementRef<'a>, NavigationError> {
    let parsed = parse_selector(selector)?;
    doc.select(&parsed)
        .next()
        .ok_or_else(|| NavigationError::SelectorMissing {
            selector: selector.to_string(),
        })
}

fn named(element: ElementRef<'_>, selector: &str) -> Result<String, NavigationError> {
    element
        .value()
        .attr("name")
        .map(str::to_string)
        .ok_or_else(|| NavigationError::Unnamed {
            selector: selector.to_string(),
        })
}

/// A form submission ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRequest {
    pub method: Method,
    pub action: Url,
    pub fields: Vec<(String, String)>,
}

fn is_button(element: ElementRef<'_>) -> bool {
    let el = element.value();
    match el.name() {
        "button" => true,
        "input" => matches!(
            el.attr("type").map(str::to_ascii_lowercase).as_deref(),
            Some("submit" | "button" | "image" | "reset")
        ),
        _ => false,
    }
}

/// Successful controls of `form`, in document order
fn form_fields(form: ElementRef<'_>) -> Vec<(String, String)> {
    let Ok(controls) = Selector::parse("input, select, textarea") else {
        return Vec::new();
    };

    let mut fields = Vec::new();
    for control in form.select(&controls) {
        let el = control.value();
        let Some(name) = el.attr("name") else { continue };
        if el.attr("disabled").is_some() || is_button(control) {
            continue;
        }
        let value = match el.name() {
            "select" => {
                let Ok(options) = Selector::parse("option") else { continue };
                let mut opts = control.select(&options);
                let chosen = control
                    .select(&options)
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| opts.next());
                chosen.map(|o| {
                    o.value()
                        .attr("value")
                        .map_or_else(|| o.text().collect::<String>(), str::to_string)
                })
            }
            "textarea" => Some(control.text().collect()),
            _ => {
                let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
                if matches!(kind.as_str(), "radio" | "checkbox") && el.attr("checked").is_none() {
                    None
                } else {
                    Some(el.attr("value").unwrap_or(if kind == "checkbox" || kind == "radio" { "on" } else { "" }).to_string())
                }
            }
        };
        if let Some(value) = value {
            fields.push((name.to_string(), value));
        }
    }
    fields
}

/// Build the request a browser would send when `selector` is submitted
pub fn build_form_request(
    html: &str,
    base: &Url,
    selector: &str,
    overrides: &[(String, String)],
) -> Result<FormRequest, NavigationError> {
    let doc = Html::parse_document(html);
    let target = find_first(&doc, selector)?;

    let form = if target.value().name() == "form" {
        target
    } else {
        target
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "form")
            .ok_or_else(|| NavigationError::NoForm {
                selector: selector.to_string(),
            })?
    };

    let mut fields = form_fields(form);
    for (name, value) in overrides {
        match fields.iter().position(|(n, _)| n == name) {
            Some(first) => {
                fields[first].1.clone_from(value);
                let mut index = 0;
                fields.retain(|(n, _)| {
                    let keep = index <= first || n != name;
                    index += 1;
                    keep
                });
            }
            None => fields.push((name.clone(), value.clone())),
        }
    }
    if is_button(target) {
        if let Some(name) = target.value().attr("name") {
            let value = target.value().attr("value").unwrap_or_default();
            fields.push((name.to_string(), value.to_string()));
        }
    }

    let method = if form
        .value()
        .attr("method")
        .is_some_and(|m| m.eq_ignore_ascii_case("post"))
    {
        Method::POST
    } else {
        Method::GET
    };
    let action = match form.value().attr("action").map(str::trim) {
        Some(a) if !a.is_empty() => base.join(a).map_err(|_| NavigationError::Request {
            url: a.to_string(),
            message: "unresolvable form action".to_string(),
        })?,
        _ => base.clone(),
    };

    Ok(FormRequest {
        method,
        action,
        fields,
    })
}

#[async_trait]
impl Page for HttpPage {
    async fn goto(&mut self, url: &str) -> Result<(), NavigationError> {
        let request = self.client.get(url);
        self.load(request, url).await
    }

    async fn wait_for(&mut self, selector: &str) -> Result<(), NavigationError> {
        // server-rendered: the element is either there now or never
        if self.exists(selector).await? {
            Ok(())
        } else {
            Err(NavigationError::SelectorMissing {
                selector: selector.to_string(),
            })
        }
    }

    async fn exists(&self, selector: &str) -> Result<bool, NavigationError> {
        let parsed = parse_selector(selector)?;
        let doc = Html::parse_document(self.document()?);
        let found = doc.select(&parsed).next().is_some();
        Ok(found)
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, NavigationError> {
        let parsed = parse_selector(selector)?;
        let doc = Html::parse_document(self.document()?);
        let value = doc
            .select(&parsed)
            .next()
            .and_then(|e| e.value().attr(name).map(str::to_string));
        Ok(value)
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), NavigationError> {
        let name = {
            let doc = Html::parse_document(self.document()?);
            named(find_first(&doc, selector)?, selector)?
        };
        self.set_override(name, value.to_string());
        Ok(())
    }

    async fn check(&mut self, selector: &str) -> Result<(), NavigationError> {
        let (name, value) = {
            let doc = Html::parse_document(self.document()?);
            let element = find_first(&doc, selector)?;
            let value = element.value().attr("value").unwrap_or("on").to_string();
            (named(element, selector)?, value)
        };
        self.set_override(name, value);
        Ok(())
    }

    async fn submit(&mut self, selector: &str) -> Result<(), NavigationError> {
        let base = self.url.clone().ok_or(NavigationError::NoDocument)?;
        let form = build_form_request(self.document()?, &base, selector, &self.overrides)?;
        debug!("Submitting {} {} ({} fields)", form.method, form.action, form.fields.len());

        let target = form.action.to_string();
        let request = if form.method == Method::POST {
            self.client.post(form.action).form(&form.fields)
        } else {
            let mut action = form.action;
            action.query_pairs_mut().clear().extend_pairs(&form.fields);
            self.client.get(action)
        };
        self.load(request, &target).await
    }

    async fn content(&self) -> Result<String, NavigationError> {
        self.document().map(str::to_string)
    }

    fn url(&self) -> String {
        self.url.as_ref().map(Url::to_string).unwrap_or_default()
    }
}
