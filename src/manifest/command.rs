//! Shell-script manifests, e.g. the ZINC tranche downloaders:
//!
//! ```text
//! mkdir -pv H04 && wget --user gpcr --password xtal http://files.docking.org/2D/H0/H04M500.smi.gz -O H04/H04M500.smi.gz
//! mkdir -pv H04 && curl --user gpcr:xtal -o H04/H04M400.smi.gz http://files.docking.org/2D/H0/H04M400.smi.gz
//! ```

use crate::engine::models::Credentials;
use crate::error::{CredentialError, ManifestError};

use super::{ParseContext, ParsedManifest, build_target, is_remote_url};

const SEPARATORS: [&str; 4] = ["&&", "||", ";", "|"];

#[derive(Debug, Default, PartialEq, Eq)]
struct Invocation {
    url: Option<String>,
    output: Option<String>,
    mkdir: Option<String>,
    prefix: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

pub(super) fn parse(content: &str, ctx: &ParseContext<'_>) -> ParsedManifest {
    let mut parsed = ParsedManifest::default();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invocation = match scan(line) {
            Ok(invocation) => invocation,
            Err(reason) => {
                parsed.errors.push(ManifestError::Parse {
                    line: line_no,
                    reason,
                });
                continue;
            }
        };
        let Some(url) = invocation.url.as_deref() else {
            parsed.errors.push(ManifestError::Parse {
                line: line_no,
                reason: "no remote URL found".into(),
            });
            continue;
        };

        let subdir = output_dir(&invocation);
        let mut target = match build_target(ctx, url, subdir.as_deref(), line_no) {
            Ok(target) => target,
            Err(err) => {
                parsed.errors.push(err);
                continue;
            }
        };

        match credentials(&invocation, line_no) {
            Ok(Some(creds)) => target.credentials = Some(creds),
            Ok(None) => {}
            Err(err) => parsed.credential_errors.push(err),
        }
        parsed.targets.push(target);
    }

    parsed
}

fn scan(line: &str) -> Result<Invocation, String> {
    let tokens = shlex::split(line).ok_or_else(|| "unbalanced quoting".to_owned())?;
    let mut invocation = Invocation::default();
    let mut in_mkdir = false;
    let mut iter = tokens.iter().map(String::as_str);

    while let Some(token) = iter.next() {
        if SEPARATORS.contains(&token) {
            in_mkdir = false;
            continue;
        }
        if token == "mkdir" {
            in_mkdir = true;
            continue;
        }
        if in_mkdir {
            if !token.starts_with('-') && invocation.mkdir.is_none() {
                invocation.mkdir = Some(token.to_owned());
            }
            continue;
        }

        if let Some((flag, value)) = token.split_once('=')
            && flag.starts_with("--")
        {
            assign(&mut invocation, flag, value.to_owned());
            continue;
        }
        if takes_value(token) {
            let value = iter
                .next()
                .ok_or_else(|| format!("flag {token} is missing its value"))?;
            assign(&mut invocation, token, value.to_owned());
            continue;
        }
        if is_remote_url(token) && invocation.url.is_none() {
            invocation.url = Some(token.to_owned());
        }
    }

    Ok(invocation)
}

fn takes_value(flag: &str) -> bool {
    matches!(
        flag,
        "-O" | "-o"
            | "-P"
            | "-u"
            | "--output"
            | "--output-document"
            | "--directory-prefix"
            | "--user"
            | "--http-user"
            | "--password"
            | "--http-password"
            | "--http-passwd"
    )
}

fn assign(invocation: &mut Invocation, flag: &str, value: String) {
    match flag {
        "-O" | "-o" | "--output" | "--output-document" => invocation.output = Some(value),
        "-P" | "--directory-prefix" => invocation.prefix = Some(value),
        "-u" | "--user" | "--http-user" => invocation.user = Some(value),
        "--password" | "--http-password" | "--http-passwd" => invocation.password = Some(value),
        _ => {}
    }
}

/// Directory the script writes into, relative to the source cache.
fn output_dir(invocation: &Invocation) -> Option<String> {
    if let Some(output) = invocation.output.as_deref() {
        let parent = output
            .rsplit_once(['/', '\\'])
            .map(|(dir, _)| dir)
            .unwrap_or("");
        let joined = match invocation.prefix.as_deref() {
            Some(prefix) => format!("{prefix}/{parent}"),
            None => parent.to_owned(),
        };
        return Some(joined);
    }
    invocation
        .prefix
        .clone()
        .or_else(|| invocation.mkdir.clone())
}

fn credentials(invocation: &Invocation, line: usize) -> Result<Option<Credentials>, CredentialError> {
    let malformed = |reason: &str| CredentialError::Malformed {
        line,
        reason: reason.to_owned(),
    };
    match (invocation.user.as_deref(), invocation.password.as_deref()) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(malformed("password given without a user")),
        (Some(user), password) => {
            let (name, inline_password) = match user.split_once(':') {
                Some((name, pass)) => (name, Some(pass)),
                None => (user, None),
            };
            if name.is_empty() {
                return Err(malformed("empty user name"));
            }
            let password = password.or(inline_password).unwrap_or_default();
            Ok(Some(Credentials::new(name, password)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;

    fn ctx(cache: &Path) -> ParseContext<'_> {
        ParseContext {
            source_id: "zinc",
            cache_dir: cache,
            base_url: None,
            archive_suffixes: &[],
        }
    }

    #[test]
    fn parses_zinc_tranche_script() {
        let script = [
            "mkdir -pv H04 && wget --user gpcr --password xtal http://files.docking.org/2D/H0/H04M500.smi.gz -O H04/H04M500.smi.gz",
            "mkdir -pv H04 && wget --user gpcr --password xtal http://files.docking.org/2D/H0/H04M400.smi.gz -O H04/H04M400.smi.gz",
            "mkdir -pv H04 && wget --user gpcr --password xtal http://files.docking.org/2D/H0/H04M300.smi.gz -O H04/H04M300.smi.gz",
            "mkdir -pv H04 && wget --user gpcr --password xtal http://files.docking.org/2D/H0/H04M200.smi.gz -O H04/H04M200.smi.gz",
        ]
        .join("\n");
        let cache = Path::new("/cache/zinc");

        let parsed = parse(&script, &ctx(cache));

        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.targets.len(), 4);
        let expected = Credentials::new("gpcr", "xtal");
        for (target, tranche) in parsed.targets.iter().zip(["500", "400", "300", "200"]) {
            assert_eq!(target.credentials.as_ref(), Some(&expected));
            assert_eq!(target.id.path, format!("H04/H04M{tranche}.smi.gz"));
            assert_eq!(
                target.local_path,
                PathBuf::from(format!("/cache/zinc/H04/H04M{tranche}.smi.gz"))
            );
        }
    }

    #[test]
    fn falls_back_to_mkdir_hint_and_curl_credentials() {
        let line = "mkdir -p H05 && curl --remote-time --fail --user gpcr:xtal http://files.docking.org/2D/H0/H05M500.smi.gz";
        let parsed = parse(line, &ctx(Path::new("/c")));

        let target = &parsed.targets[0];
        assert_eq!(target.id.path, "H05/H05M500.smi.gz");
        assert_eq!(target.credentials, Some(Credentials::new("gpcr", "xtal")));
    }

    #[test]
    fn skips_lines_without_url_but_keeps_the_rest() {
        let script = "set -e\n# comment\n\nwget http://x.test/a.smi -O a.smi\n";
        let parsed = parse(script, &ctx(Path::new("/c")));

        assert_eq!(parsed.targets.len(), 1);
        assert_eq!(parsed.errors.len(), 1);
        assert!(matches!(parsed.errors[0], ManifestError::Parse { line: 1, .. }));
    }

    #[test]
    fn malformed_credentials_leave_target_unauthenticated() {
        let parsed = parse(
            "wget --password xtal http://x.test/a.smi",
            &ctx(Path::new("/c")),
        );
        assert_eq!(parsed.targets.len(), 1);
        assert!(parsed.targets[0].credentials.is_none());
        assert_eq!(parsed.credential_errors.len(), 1);
    }

    #[test]
    fn output_name_does_not_override_url_file_name() {
        let parsed = parse(
            "wget http://x.test/real.smi.gz --output-document=tranches/renamed.gz",
            &ctx(Path::new("/c")),
        );
        assert_eq!(parsed.targets[0].id.path, "tranches/real.smi.gz");
    }

    #[test]
    fn reports_dangling_flags() {
        let parsed = parse("wget http://x.test/a.smi -O", &ctx(Path::new("/c")));
        assert!(parsed.targets.is_empty());
        assert_eq!(parsed.errors.len(), 1);
    }
}
