//! End-to-end environment scenarios against file:// sources.

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;
use hermit::config::EnvConfig;
use hermit::environment::Environment;
use hermit::errors::HermitError;
use hermit::manifest::selector::Selector;
use hermit::state::{State, StateConfig};
use std::fs;

fn write_tgz(path: &Utf8Path, entries: &[(&str, &str)]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = fs::File::create(path).unwrap();
    let gz = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

struct Fixture {
    dir: Utf8PathBuf,
    env: Environment,
}

fn fixture(tmp: &tempfile::TempDir) -> Fixture {
    let dir = Utf8Path::from_path(tmp.path()).unwrap().to_owned();
    fs::create_dir_all(dir.join("manifests")).unwrap();

    let state = State::open(dir.join("state"), StateConfig::default()).unwrap();
    let config = EnvConfig {
        manage_git: false,
        sources: Some(vec![dir.join("manifests").to_string()]),
        ..EnvConfig::default()
    };
    let project = dir.join("project");
    Environment::init(&project, &config, None).unwrap();
    let env = Environment::open(state, &project).unwrap();
    Fixture { dir, env }
}

fn add_package(fixture: &Fixture, name: &str, version: &str, binaries: &[&str], extra: &str) {
    let entries: Vec<(&str, &str)> = binaries.iter().map(|b| (*b, "#!/bin/sh\n")).collect();
    write_tgz(
        &fixture.dir.join(format!("artifacts/{name}-{version}.tar.gz")),
        &entries,
    );
    let quoted: Vec<String> = binaries.iter().map(|b| format!("{b:?}")).collect();
    fs::write(
        fixture.dir.join(format!("manifests/{name}.hcl")),
        format!(
            r#"
description = "{name}"
binaries = [{binaries}]
source = "file://{dir}/artifacts/{name}-${{version}}.tar.gz"
{extra}
version "{version}" {{}}
"#,
            binaries = quoted.join(", "),
            dir = fixture.dir,
        ),
    )
    .unwrap();
}

#[test]
fn install_links_and_marks_the_package() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = fixture(&tmp);
    add_package(&fixture, "foo", "1.0.0", &["foo"], "");

    let mut package = fixture.env.resolve(&"foo".parse::<Selector>().unwrap()).unwrap();
    fixture.env.install(&mut package).unwrap();

    // the two-hop proxy chain exists
    let bin = fixture.env.bin_dir();
    assert_eq!(
        fs::read_link(bin.join("foo")).unwrap().to_str().unwrap(),
        ".foo-1.0.0.pkg"
    );
    assert_eq!(
        fs::read_link(bin.join(".foo-1.0.0.pkg")).unwrap().to_str().unwrap(),
        "hermit"
    );

    // exactly one marker link, one visible link
    let markers: Vec<String> = bin
        .read_dir_utf8()
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().to_string();
            (name.starts_with('.') && name.ends_with(".pkg")).then_some(name)
        })
        .collect();
    assert_eq!(markers, vec![".foo-1.0.0.pkg".to_string()]);

    // the db has a record for the installed reference
    assert!(fixture.env.state().db().get("foo-1.0.0").unwrap().is_some());

    // the extracted binary is reachable through the store farm
    let (reference, resolved) = fixture.env.resolve_link(&bin.join("foo")).unwrap();
    assert_eq!(reference.to_string(), "foo-1.0.0");
    let binaries = resolved.resolve_binaries().unwrap();
    assert_eq!(binaries.len(), 1);
    assert!(binaries[0].as_str().ends_with("pkg/foo-1.0.0/foo"));
}

#[test]
fn second_package_with_same_binary_fails_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = fixture(&tmp);
    add_package(&fixture, "a", "1.0.0", &["x"], "");
    add_package(&fixture, "b", "1.0.0", &["x"], "");

    let mut a = fixture.env.resolve(&"a".parse::<Selector>().unwrap()).unwrap();
    fixture.env.install(&mut a).unwrap();

    let mut b = fixture.env.resolve(&"b".parse::<Selector>().unwrap()).unwrap();
    let err = fixture.env.install(&mut b).unwrap_err();
    assert!(matches!(err, HermitError::BinaryConflict { .. }));

    // bin/x still resolves to a's binary
    let (reference, _) = fixture.env.resolve_link(&fixture.env.bin_dir().join("x")).unwrap();
    assert_eq!(reference.to_string(), "a-1.0.0");
}

#[test]
fn install_message_triggers_surface_to_the_caller() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = fixture(&tmp);
    add_package(
        &fixture,
        "chatty",
        "1.0.0",
        &["chatty"],
        r#"
on install {
  message {
    text = "remember to run chatty --setup"
  }
}
"#,
    );

    let mut package = fixture.env.resolve(&"chatty".parse::<Selector>().unwrap()).unwrap();
    let changes = fixture.env.install(&mut package).unwrap();
    assert!(changes
        .messages
        .iter()
        .any(|m| m.contains("remember to run chatty --setup")));
}

#[test]
fn reinstalling_a_different_version_replaces_the_links() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = fixture(&tmp);
    add_package(&fixture, "tool", "1.0.0", &["tool"], "");

    let mut v1 = fixture.env.resolve(&"tool-1.0.0".parse::<Selector>().unwrap()).unwrap();
    fixture.env.install(&mut v1).unwrap();

    // a newer version appears upstream
    write_tgz(
        &fixture.dir.join("artifacts/tool-2.0.0.tar.gz"),
        &[("tool", "#!/bin/sh\necho 2\n")],
    );
    fs::write(
        fixture.dir.join("manifests/tool.hcl"),
        format!(
            r#"
description = "tool"
binaries = ["tool"]
source = "file://{dir}/artifacts/tool-${{version}}.tar.gz"
version "1.0.0" {{}}
version "2.0.0" {{}}
"#,
            dir = fixture.dir,
        ),
    )
    .unwrap();

    let mut v2 = fixture.env.resolve(&"tool".parse::<Selector>().unwrap()).unwrap();
    assert_eq!(v2.reference.to_string(), "tool-2.0.0");
    fixture.env.install(&mut v2).unwrap();

    let refs = fixture.env.installed_refs().unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].to_string(), "tool-2.0.0");
    let (reference, _) =
        fixture.env.resolve_link(&fixture.env.bin_dir().join("tool")).unwrap();
    assert_eq!(reference.to_string(), "tool-2.0.0");
}

#[test]
fn concurrent_unpacks_produce_one_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let fixture = fixture(&tmp);
    add_package(&fixture, "shared", "1.0.0", &["shared"], "");

    let package = fixture.env.resolve(&"shared".parse::<Selector>().unwrap()).unwrap();
    let state = fixture.env.state().clone();

    std::thread::scope(|scope| {
        for _ in 0..2 {
            let state = state.clone();
            let mut package = package.clone();
            scope.spawn(move || {
                state.cache_and_unpack(&mut package).unwrap();
                // neither returns before the tree is fully populated
                assert!(package.root.join("shared").exists());
            });
        }
    });
}
