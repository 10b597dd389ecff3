use std::{fs, io::Write, path::Path};

use anyhow::{bail, Context, Result};
use tether_core::{parse_export, write_text_atomic};
use tether_intercept::{transform_bundle, ActionLocator};
use tether_native::{content_hash, is_valid_content_hash, HostConfig, TrustStore};

use crate::cli_args::{CliCommand, SettingsCommand, TrustCommand};

fn read_text(path: &Path, what: &str) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {what} {}", path.display()))
}

pub(crate) fn execute_command(
    command: &CliCommand,
    config: &HostConfig,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        CliCommand::Locate { bundle, json } => execute_locate(bundle, *json, out),
        CliCommand::Transform { bundle, out: path } => {
            execute_transform(bundle, path.as_deref(), out)
        }
        CliCommand::Trust { command } => execute_trust_command(command, config, out),
        CliCommand::Settings {
            command: SettingsCommand::Validate { file },
        } => execute_settings_validate(file, out),
        CliCommand::Config => {
            writeln!(out, "{}", serde_json::to_string_pretty(config)?)?;
            Ok(())
        }
    }
}

fn execute_locate(bundle: &Path, json: bool, out: &mut dyn Write) -> Result<()> {
    let code = read_text(bundle, "bundle")?;
    let locator = ActionLocator::default();
    let report = locator.locate_all(&code);
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        return Ok(());
    }
    for anchor in locator.anchors() {
        match report.get(&anchor.label) {
            Some(located) => writeln!(
                out,
                "{}: {} at offset {}",
                anchor.label, located.name, located.offset
            )?,
            None => writeln!(out, "{}: missing", anchor.label)?,
        }
    }
    Ok(())
}

fn execute_transform(bundle: &Path, destination: Option<&Path>, out: &mut dyn Write) -> Result<()> {
    let code = read_text(bundle, "bundle")?;
    let transform = transform_bundle(&code);
    if !transform.is_modified() {
        tracing::warn!(bundle = %bundle.display(), "no anchors matched; bundle left unchanged");
    }

    let Some(destination) = destination else {
        out.write_all(transform.code.as_bytes())?;
        return Ok(());
    };
    write_text_atomic(destination, &transform.code)?;
    writeln!(out, "wrote {}", destination.display())?;
    if let Some(name) = &transform.patched_action {
        writeln!(out, "patched action builder: {name}")?;
    }
    if let Some(name) = &transform.store_accessor {
        writeln!(out, "exported store accessor: {name}")?;
    }
    for label in &transform.missing {
        writeln!(out, "missing: {label}")?;
    }
    Ok(())
}

fn execute_trust_command(
    command: &TrustCommand,
    config: &HostConfig,
    out: &mut dyn Write,
) -> Result<()> {
    let store_path = config.trust_store_path();
    let mut store = TrustStore::load(&store_path);
    match command {
        TrustCommand::List => {
            for hash in store.hashes() {
                writeln!(out, "{hash}")?;
            }
        }
        TrustCommand::Hash { file } => {
            let code = read_text(file, "native payload")?;
            let hash = content_hash(&code);
            let status = if store.contains(&hash) {
                "trusted"
            } else {
                "untrusted"
            };
            writeln!(out, "{hash} {status}")?;
        }
        TrustCommand::Revoke { hash } => {
            if !is_valid_content_hash(hash) {
                bail!("'{hash}' is not a sha256 hex digest");
            }
            if !store.remove(hash)? {
                bail!("hash {hash} is not in {}", store_path.display());
            }
            writeln!(out, "revoked {}", hash.to_ascii_lowercase())?;
        }
    }
    Ok(())
}

fn execute_settings_validate(file: &Path, out: &mut dyn Write) -> Result<()> {
    let raw = read_text(file, "settings export")?;
    let export = parse_export(&raw)?;
    let flags = export
        .feature_flags
        .as_ref()
        .map(|flags| flags.len())
        .unwrap_or(0);
    writeln!(
        out,
        "valid settings export: version {}, {} stores, {} feature flags, exported {}",
        export.version,
        export.stores.len(),
        flags,
        export.timestamp
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const BUNDLE: &str = r#"let q=0;function Xe(e,t){function n(...r){if(t){let o=t(...r);return{type:e,payload:o.payload,..."meta"in o&&{meta:o.meta}}}return{type:e,payload:r[0]}}return n}function Ye(){if(!Qe)throw Error("No global store set");return Qe}"#;

    fn run(command: CliCommand, config: &HostConfig) -> Result<String> {
        let mut out = Vec::new();
        execute_command(&command, config, &mut out)?;
        Ok(String::from_utf8(out).expect("utf8 output"))
    }

    fn config_in(root: &Path) -> HostConfig {
        HostConfig {
            user_data_dir: root.join("user-data"),
            ..HostConfig::default()
        }
    }

    #[test]
    fn functional_locate_reports_names_and_offsets() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bundle = temp.path().join("app.js");
        fs::write(&bundle, BUNDLE).expect("write bundle");

        let output = run(
            CliCommand::Locate {
                bundle: bundle.clone(),
                json: false,
            },
            &HostConfig::default(),
        )
        .expect("locate");
        let offset = BUNDLE.find("Ye()").expect("Ye offset");
        assert!(output.contains(&format!("store-accessor: Ye at offset {offset}")));
        assert!(output.contains("prepare-action: Xe at offset"));
    }

    #[test]
    fn functional_transform_writes_patched_bundle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bundle = temp.path().join("app.js");
        let patched = temp.path().join("out/app.patched.js");
        fs::write(&bundle, BUNDLE).expect("write bundle");

        let output = run(
            CliCommand::Transform {
                bundle,
                out: Some(patched.clone()),
            },
            &HostConfig::default(),
        )
        .expect("transform");
        assert!(output.contains("patched action builder: Xe"));
        assert!(output.contains("exported store accessor: Ye"));
        let code = fs::read_to_string(&patched).expect("patched bundle");
        assert!(code.contains("function __TetherUnpatched_Xe("));
    }

    #[test]
    fn functional_trust_hash_then_revoke() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_in(temp.path());
        let payload = temp.path().join("legacy.js");
        fs::write(&payload, "console.log('native')").expect("write payload");
        let hash = content_hash("console.log('native')");
        TrustStore::load(&config.trust_store_path())
            .insert(&hash)
            .expect("trust");

        let output = run(CliCommand::Trust { command: TrustCommand::Hash { file: payload } }, &config)
            .expect("hash");
        assert_eq!(output, format!("{hash} trusted\n"));
        let listed = run(CliCommand::Trust { command: TrustCommand::List }, &config).expect("list");
        assert_eq!(listed, format!("{hash}\n"));

        run(
            CliCommand::Trust {
                command: TrustCommand::Revoke { hash: hash.clone() },
            },
            &config,
        )
        .expect("revoke");
        assert!(TrustStore::load(&config.trust_store_path()).is_empty());

        let error = run(
            CliCommand::Trust {
                command: TrustCommand::Revoke { hash },
            },
            &config,
        )
        .expect_err("second revoke");
        assert!(error.to_string().contains("is not in"));
    }

    #[test]
    fn regression_revoke_rejects_malformed_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let error = run(
            CliCommand::Trust {
                command: TrustCommand::Revoke {
                    hash: "../../etc".to_string(),
                },
            },
            &config_in(temp.path()),
        )
        .expect_err("malformed");
        assert!(error.to_string().contains("not a sha256 hex digest"));
    }

    #[test]
    fn functional_settings_validate_reports_store_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("export.json");
        fs::write(
            &file,
            r#"{"version":1,"timestamp":"2026-01-02T03:04:05Z","stores":{"a":{},"b":{"k":1}},"featureFlags":{"x":true}}"#,
        )
        .expect("write export");
        let output = run(
            CliCommand::Settings {
                command: SettingsCommand::Validate { file },
            },
            &HostConfig::default(),
        )
        .expect("validate");
        assert!(output.contains("version 1, 2 stores, 1 feature flags"));

        let bad = temp.path().join("bad.json");
        fs::write(&bad, r#"{"version":2,"stores":{}}"#).expect("write bad export");
        assert!(run(
            CliCommand::Settings {
                command: SettingsCommand::Validate { file: bad },
            },
            &HostConfig::default(),
        )
        .is_err());
    }

    #[test]
    fn unit_config_prints_resolved_paths() {
        let config = HostConfig {
            bundle_dir: PathBuf::from("/opt/host/bundle"),
            ..HostConfig::default()
        };
        let output = run(CliCommand::Config, &config).expect("config");
        let value: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(value["bundle_dir"], "/opt/host/bundle");
        assert_eq!(value["trust_timeout_ms"], 60_000);
    }
}
