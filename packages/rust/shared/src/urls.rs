//! URL canonicalization and derivation helpers.

use url::Url;

/// Canonical form of a URL used as the uniqueness key.
///
/// Lower-cases the whole URL, strips the fragment, strips trailing slashes
/// from the path (the root path stays `/`), and stable-sorts query parameters
/// by key. Input that does not parse as an absolute URL gets the same
/// treatment textually.
pub fn normalize_url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();

    let Ok(mut url) = Url::parse(&lowered) else {
        return normalize_text(&lowered);
    };

    url.set_fragment(None);

    if !url.cannot_be_a_base() {
        let trimmed = url.path().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            url.set_path("/");
        } else {
            url.set_path(&trimmed);
        }
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        // `sort_by` is stable: repeated keys keep their relative order.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    url.to_string()
}

/// Textual fallback for strings the URL parser rejects.
fn normalize_text(lowered: &str) -> String {
    let without_fragment = lowered.split('#').next().unwrap_or_default();
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let mut out = base.trim_end_matches('/').to_string();
    if out.is_empty() {
        out.push('/');
    }

    if let Some(query) = query {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        params.sort_by(|a, b| param_key(a).cmp(param_key(b)));
        if !params.is_empty() {
            out.push('?');
            out.push_str(&params.join("&"));
        }
    }

    out
}

fn param_key(param: &str) -> &str {
    param.split_once('=').map_or(param, |(key, _)| key)
}

/// Host of a URL, lower-cased. Malformed input is returned as-is so callers
/// can still key on something stable.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| url.to_string())
}

/// Human-ish slug derived from a URL: the last path segment without its
/// extension, or the host for root URLs.
pub fn url_slug(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return sanitize_slug(url);
    };

    let segment = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .map(|s| s.rsplit_once('.').map_or(s, |(stem, _)| stem).to_string());

    match segment {
        Some(s) if !s.is_empty() => sanitize_slug(&s),
        _ => sanitize_slug(parsed.host_str().unwrap_or("untitled")),
    }
}

fn sanitize_slug(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Docs/Guide/#Intro"),
            "https://example.com/docs/guide"
        );
        assert_eq!(normalize_url("https://example.com"), "https://example.com/");
        assert_eq!(normalize_url("https://example.com///"), "https://example.com/");
    }

    #[test]
    fn sorts_query_params_stably() {
        assert_eq!(
            normalize_url("https://example.com/search?b=2&a=1&b=1&a=0"),
            "https://example.com/search?a=1&a=0&b=2&b=1"
        );
        assert_eq!(normalize_url("https://example.com/x?"), "https://example.com/x");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "https://Example.com/a/b/?z=1&y=2#frag",
            "http://example.com",
            "https://example.com/path%2Fwith%2Fslash/",
            "https://example.com/q?a=hello world&a=x",
            "not a url/",
            "example.com/page/?b=1&a=2#x",
            "mailto:Someone@Example.com",
        ] {
            let once = normalize_url(raw);
            assert_eq!(normalize_url(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn equivalent_urls_collide() {
        assert_eq!(
            normalize_url("https://example.com/page?b=2&a=1"),
            normalize_url("https://EXAMPLE.com/page/?a=1&b=2#top")
        );
    }

    #[test]
    fn textual_fallback() {
        assert_eq!(normalize_url("Example.com/Page/#x"), "example.com/page");
        assert_eq!(normalize_url("example.com/p?b=1&a=2"), "example.com/p?a=2&b=1");
    }

    #[test]
    fn domain_extraction_tolerates_garbage() {
        assert_eq!(extract_domain("https://Docs.Example.com/x"), "docs.example.com");
        assert_eq!(extract_domain("example.com"), "example.com");
        assert_eq!(extract_domain("::not a url::"), "::not a url::");
    }

    #[test]
    fn slugs() {
        assert_eq!(
            url_slug("https://example.com/guide/Getting-Started.html"),
            "getting-started"
        );
        assert_eq!(url_slug("https://example.com/"), "example.com");
        assert_eq!(url_slug("https://example.com/a/b/"), "b");
    }
}
