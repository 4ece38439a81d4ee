//! Downstream propagation checks.
//!
//! After the pipeline succeeds, its side effects show up asynchronously in
//! other systems: the artifact store receives the published file, and the web
//! server later serves the synced page. These checks poll the target with a
//! direct request until the expected content is observed.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{E2eError, Result};
use crate::poll::{poll_until, PollPolicy};

/// How a target is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPath {
    /// Plain request that opts out of intermediate caches. Used for
    /// byte-level artifact assertions.
    Raw,
    /// Request shaped like a browser page load.
    Browser,
}

/// What the fetched content must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentExpectation {
    /// Case-sensitive substring match.
    Contains { text: String },
    /// The first `<hN>` element's text equals `text` exactly, after
    /// collapsing whitespace.
    HeadingText { level: u8, text: String },
}

impl ContentExpectation {
    pub fn contains(text: &str) -> Self {
        ContentExpectation::Contains {
            text: text.to_string(),
        }
    }

    pub fn heading(level: u8, text: &str) -> Self {
        ContentExpectation::HeadingText {
            level,
            text: text.to_string(),
        }
    }

    pub fn is_satisfied_by(&self, body: &str) -> bool {
        match self {
            ContentExpectation::Contains { text } => body.contains(text.as_str()),
            ContentExpectation::HeadingText { level, text } => {
                first_heading(body, *level).as_deref() == Some(text.as_str())
            }
        }
    }

    fn describe_mismatch(&self, body: &str) -> String {
        match self {
            ContentExpectation::Contains { text } => format!("body lacks '{text}'"),
            ContentExpectation::HeadingText { level, .. } => match first_heading(body, *level) {
                Some(found) => format!("h{level} is '{found}'"),
                None => format!("no h{level} element"),
            },
        }
    }
}

/// Extract the text of the first heading of `level`, inner tags stripped and
/// whitespace collapsed.
pub fn first_heading(html: &str, level: u8) -> Option<String> {
    let heading = Regex::new(&format!(r"(?is)<h{level}(?:\s[^>]*)?>(.*?)</h{level}\s*>")).ok()?;
    let inner = heading.captures(html)?.get(1)?.as_str();
    let tags = Regex::new(r"<[^>]*>").ok()?;
    let text = tags.replace_all(inner, "");
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Content returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub status: u16,
    pub body: String,
}

impl FetchedContent {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that can fetch a URL.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, target: &Url, access: AccessPath) -> Result<FetchedContent>;
}

/// One downstream target and what it must eventually serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergenceCheck {
    pub target: Url,
    pub access: AccessPath,
    pub expected: ContentExpectation,
}

/// Poll `check.target` until its content satisfies the expectation.
pub async fn verify_downstream_propagation<F>(
    fetcher: &F,
    check: &ConvergenceCheck,
    policy: &PollPolicy,
) -> Result<FetchedContent>
where
    F: ContentFetcher + ?Sized,
{
    let last_observation = std::sync::Mutex::new(String::from("no response"));
    let observation = &last_observation;

    let outcome = poll_until(
        &format!("propagation to {}", check.target),
        policy,
        move || async move {
            let content = fetcher.fetch(&check.target, check.access).await?;
            let note = if !content.is_success() {
                format!("HTTP {}", content.status)
            } else if check.expected.is_satisfied_by(&content.body) {
                return Ok::<_, E2eError>(Some(content));
            } else {
                check.expected.describe_mismatch(&content.body)
            };
            if let Ok(mut last) = observation.lock() {
                *last = note;
            }
            Ok(None)
        },
    )
    .await;

    match outcome {
        Ok(content) => {
            info!(target = %check.target, access = ?check.access, "content converged");
            Ok(content)
        }
        Err(timeout) => {
            let mut last = last_observation
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default();
            if let Some(err) = timeout.last_error {
                last = err;
            }
            Err(E2eError::DownstreamPropagationTimeout {
                target: check.target.to_string(),
                elapsed: timeout.elapsed,
                last_observation: last,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeLab;

    fn check(url: &str, expected: ContentExpectation) -> ConvergenceCheck {
        ConvergenceCheck {
            target: Url::parse(url).unwrap(),
            access: AccessPath::Raw,
            expected,
        }
    }

    #[test]
    fn test_contains_is_byte_exact() {
        let expected = ContentExpectation::contains("hello world");
        assert!(expected.is_satisfied_by("<h1>hello world</h1>"));
        assert!(!expected.is_satisfied_by("<h1>Hello World</h1>"));
        assert!(!expected.is_satisfied_by("<h1>hello  world</h1>"));
        assert!(!expected.is_satisfied_by(""));
    }

    #[test]
    fn test_heading_text_exact() {
        let expected = ContentExpectation::heading(1, "hello world");
        assert!(expected.is_satisfied_by("<html><body><h1>hello world</h1></body></html>"));
        assert!(expected.is_satisfied_by("<H1 class=\"title\">\n  hello <em>world</em>\n</H1>"));
        assert!(!expected.is_satisfied_by("<h1>hello world!</h1>"));
        assert!(!expected.is_satisfied_by("<h2>hello world</h2>"));
        assert!(!expected.is_satisfied_by("<h10>hello world</h10>"));
    }

    #[test]
    fn test_first_heading_picks_first() {
        let html = "<h1>first</h1><h1>second</h1>";
        assert_eq!(first_heading(html, 1).as_deref(), Some("first"));
        assert_eq!(first_heading(html, 2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_content_appears() {
        let lab = FakeLab::new();
        let url = "http://localhost:8081/repository/web/hello-world/index.html";
        lab.serve_after(url, "<html><body><h1>hello world</h1></body></html>", 3);
        let fetcher = lab.artifact_store();

        let content = verify_downstream_propagation(
            &fetcher,
            &check(url, ContentExpectation::contains("hello world")),
            &PollPolicy::from_secs(5, 120),
        )
        .await
        .unwrap();

        assert!(content.body.contains("hello world"));
        assert_eq!(lab.counters().content_fetches, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_content_times_out() {
        let lab = FakeLab::new();
        let url = "http://localhost:8088/";
        lab.serve_after(url, "<h1>Welcome to nginx!</h1>", 0);
        let fetcher = lab.artifact_store();

        let err = verify_downstream_propagation(
            &fetcher,
            &check(url, ContentExpectation::heading(1, "hello world")),
            &PollPolicy::from_secs(5, 30),
        )
        .await
        .unwrap_err();

        match err {
            E2eError::DownstreamPropagationTimeout {
                last_observation, ..
            } => assert_eq!(last_observation, "h1 is 'Welcome to nginx!'"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_content_times_out() {
        let lab = FakeLab::new();
        let fetcher = lab.artifact_store();

        let err = verify_downstream_propagation(
            &fetcher,
            &check(
                "http://localhost:8081/repository/web/hello-world/index.html",
                ContentExpectation::contains("hello world"),
            ),
            &PollPolicy::from_secs(5, 30),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("HTTP 404"));
    }
}
