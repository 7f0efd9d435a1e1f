//! HTML directory listings such as the PubChem `Compound/CURRENT-Full/SDF/`
//! index pages.

use std::collections::HashMap;

use scraper::{Html, Selector};
use url::Url;

use crate::engine::models::{ChecksumAlgorithm, SidecarRef};
use crate::error::ManifestError;

use super::{
    ParseContext, ParsedManifest, build_target, final_segment, is_remote_url, redact_userinfo,
};

pub(super) fn parse(content: &str, ctx: &ParseContext<'_>) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();
    let selector = match Selector::parse("a[href]") {
        Ok(sel) => sel,
        Err(_) => return parsed,
    };
    let base = ctx.base_url.and_then(|base| Url::parse(base).ok());
    let document = Html::parse_document(content);

    let mut archives: Vec<(usize, Url)> = Vec::new();
    let mut sidecars: HashMap<String, SidecarRef> = HashMap::new();

    for (index, anchor) in document.select(&selector).enumerate() {
        let entry = index + 1;
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if is_navigation(href) {
            continue;
        }
        let resolved = match resolve(href, base.as_ref()) {
            Ok(url) => url,
            Err(reason) => {
                parsed.errors.push(ManifestError::Parse {
                    line: entry,
                    reason,
                });
                continue;
            }
        };
        let Some(name) = final_segment(&resolved) else {
            continue;
        };

        if let Some((algorithm, stem)) = ChecksumAlgorithm::from_sidecar_name(name) {
            sidecars.insert(
                stem.to_owned(),
                SidecarRef {
                    url: resolved.to_string(),
                    algorithm,
                },
            );
        } else if has_archive_suffix(name, ctx.archive_suffixes) {
            archives.push((entry, resolved));
        }
    }

    for (entry, url) in archives {
        match build_target(ctx, url.as_str(), None, entry) {
            Ok(mut target) => {
                target.sidecar = sidecars.get(target.file_name()).cloned();
                parsed.targets.push(target);
            }
            Err(err) => parsed.errors.push(err),
        }
    }

    parsed
}

fn is_navigation(href: &str) -> bool {
    href.is_empty()
        || href.starts_with('?')
        || href.starts_with('#')
        || href.starts_with("..")
        || href.ends_with('/')
        || href.starts_with("mailto:")
}

fn resolve(href: &str, base: Option<&Url>) -> Result<Url, String> {
    if is_remote_url(href) {
        return Url::parse(href)
            .map_err(|err| format!("invalid link '{}': {err}", redact_userinfo(href)));
    }
    let base = base.ok_or_else(|| {
        format!("relative link '{href}' but the source has no base_url configured")
    })?;
    base.join(href).map_err(|err| {
        format!(
            "cannot resolve '{href}' against {}: {err}",
            redact_userinfo(base.as_str())
        )
    })
}

fn has_archive_suffix(name: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
}
