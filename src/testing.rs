//! Fixtures shared by unit tests: zipped app artifacts and catalog entries.

use plist::{Dictionary, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::{CatalogEntry, SourceKind};

pub fn info_plist(id: &str, version: &str) -> Vec<u8> {
    let mut dict = Dictionary::new();
    dict.insert("CFBundleIdentifier".into(), Value::String(id.into()));
    dict.insert("CFBundleShortVersionString".into(), Value::String(version.into()));
    let mut out = Vec::new();
    Value::Dictionary(dict).to_writer_xml(&mut out).unwrap();
    out
}

/// Write `<name>-<version>.zip` holding `<name>.app`; returns path and SHA-256.
pub fn make_artifact(dir: &Path, name: &str, id: &str, version: &str) -> (PathBuf, String) {
    let path = dir.join(format!("{}-{}.zip", name, version));
    let mut zip = zip::ZipWriter::new(fs::File::create(&path).unwrap());
    let opts = zip::write::SimpleFileOptions::default();
    zip.add_directory(format!("{}.app/Contents/MacOS/", name), opts)
        .unwrap();
    zip.start_file(format!("{}.app/Contents/Info.plist", name), opts)
        .unwrap();
    zip.write_all(&info_plist(id, version)).unwrap();
    zip.start_file(format!("{}.app/Contents/MacOS/{}", name, name), opts)
        .unwrap();
    zip.write_all(&vec![b'x'; 150_000]).unwrap();
    zip.finish().unwrap();
    let digest = hex::encode(Sha256::digest(fs::read(&path).unwrap()));
    (path, digest)
}

pub fn native_entry(
    id: &str,
    version: &str,
    artifact: &Path,
    sha256: Option<&str>,
) -> CatalogEntry {
    CatalogEntry {
        identity: id.into(),
        source: SourceKind::Native,
        name: "Demo".into(),
        version: version.into(),
        subtitle: None,
        developer: None,
        homepage: None,
        download_url: format!("file://{}", artifact.display()),
        sha256: sha256.map(str::to_string),
        size: None,
        download_count: None,
        app_bundle: None,
        categories: Vec::new(),
    }
}
