//! Integration tests for cache validity, eviction and persistence.
//!
//! Each test builds a small project on disk, drives it through the public
//! `Cache` API and checks the observable state of the cache.

use kiln_cache::{Artifact, Cache, CacheError, CachePlugin, StaleReason, Staleness};
use kiln_config::{ProjectConfig, ResolveConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Plugin(&'static str, &'static str);

impl CachePlugin for Plugin {
    fn name(&self) -> &str {
        self.0
    }

    fn cache_key(&self) -> Option<String> {
        Some(self.1.to_string())
    }
}

fn project() -> (TempDir, ProjectConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = ProjectConfig::new(dir.path());
    (dir, config)
}

fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
}

fn set_mtime(path: &Path, millis: u64) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_millis(millis))
        .unwrap();
}

fn no_imports() -> Vec<&'static str> {
    Vec::new()
}

// ===========================================================================
// Staleness
// ===========================================================================

#[test]
fn uncommitted_file_is_stale() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "1");
    let cache = Cache::open(config, &[]).unwrap();
    assert!(cache.is_stale(&main));
    assert!(cache.is_stale(&dir.path().join("never-existed.js")));
}

#[test]
fn committed_file_is_fresh_until_edited() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "1");
    let cache = Cache::open(config, &[]).unwrap();
    cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
    assert!(!cache.is_stale(&main));

    fs::write(&main, "2").unwrap();
    set_mtime(&main, 1_000);
    assert!(cache.is_stale(&main));
}

#[test]
fn plugin_change_invalidates_unchanged_file() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "1");
    {
        let cache = Cache::open(config.clone(), &[&Plugin("jsx", "h")]).unwrap();
        cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
        cache.save().unwrap();
    }

    let same = Cache::open(config.clone(), &[&Plugin("jsx", "h")]).unwrap();
    assert!(!same.is_stale(&main));
    drop(same);

    let other = Cache::open(config, &[&Plugin("jsx", "React.createElement")]).unwrap();
    assert_eq!(other.check(&main), Staleness::Stale(StaleReason::PluginsChanged));
}

#[test]
fn dependency_touch_keeps_dependent_fresh() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "import './dep'");
    let dep = write(dir.path(), "dep.js", "export {}");
    set_mtime(&dep, 1_000);

    let cache = Cache::open(config, &[]).unwrap();
    cache.commit(&main, ["./dep"], &Artifact::new("out")).unwrap();

    set_mtime(&dep, 9_000);
    assert!(!cache.is_stale(&main));
}

#[test]
fn dependency_edit_invalidates_dependent() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "import './dep'");
    let dep = write(dir.path(), "dep.js", "export {}");
    set_mtime(&dep, 1_000);

    let cache = Cache::open(config, &[]).unwrap();
    cache.commit(&main, ["./dep"], &Artifact::new("out")).unwrap();

    fs::write(&dep, "export const x = 1").unwrap();
    assert_eq!(
        cache.check(&main),
        Staleness::Stale(StaleReason::DependencyChanged(dep))
    );
}

#[test]
fn stale_files_checks_batch_concurrently() {
    let (dir, config) = project();
    let cache = Cache::open(config, &[]).unwrap();
    let files: Vec<PathBuf> = (0..32)
        .map(|i| write(dir.path(), &format!("f{i}.js"), &i.to_string()))
        .collect();
    for file in files.iter().step_by(2) {
        cache.commit(file, no_imports(), &Artifact::new("out")).unwrap();
    }

    let stale = cache.stale_files(&files);
    let expected: Vec<PathBuf> = files.iter().skip(1).step_by(2).cloned().collect();
    assert_eq!(stale, expected);
}

#[test]
fn concurrent_checks_and_commits() {
    let (dir, config) = project();
    let cache = Cache::open(config, &[]).unwrap();
    let shared = write(dir.path(), "shared.js", "export {}");
    let files: Vec<PathBuf> = (0..8)
        .map(|i| write(dir.path(), &format!("m{i}.js"), "import './shared'"))
        .collect();

    std::thread::scope(|scope| {
        for file in &files {
            let cache = &cache;
            scope.spawn(move || {
                assert!(cache.is_stale(file));
                cache.commit(file, ["./shared"], &Artifact::new("out")).unwrap();
                assert!(!cache.is_stale(file));
            });
        }
    });

    assert_eq!(cache.graph().dependents_of(&shared).len(), files.len());
}

// ===========================================================================
// Dependency graph and sweep
// ===========================================================================

#[test]
fn set_dependencies_applies_diff() {
    let (dir, config) = project();
    let f = write(dir.path(), "f.js", "");
    let [a, b, c] = ["a.js", "b.js", "c.js"].map(|n| write(dir.path(), n, n));
    let cache = Cache::open(config, &[]).unwrap();
    cache.commit(&f, no_imports(), &Artifact::new("out")).unwrap();

    let graph = cache.graph();
    graph
        .set_dependencies(&f, [a.clone(), b.clone()].into_iter().collect())
        .unwrap();
    graph
        .set_dependencies(&f, [b.clone(), c.clone()].into_iter().collect())
        .unwrap();

    assert!(!graph.dependents_of(&a).contains(&f));
    assert!(graph.dependents_of(&b).contains(&f));
    assert!(graph.dependents_of(&c).contains(&f));
    assert!(!graph.dependencies().contains(&a));
}

#[test]
fn deleting_dependency_evicts_transitive_dependents() {
    let (dir, config) = project();
    let root = dir.path();
    let leaf = write(root, "leaf.js", "export {}");
    let mid = write(root, "mid.js", "import './leaf'");
    let top = write(root, "top.js", "import './mid'");
    let unrelated = write(root, "unrelated.js", "");

    let cache = Cache::open(config, &[]).unwrap();
    cache.commit(&mid, ["./leaf"], &Artifact::new("mid")).unwrap();
    cache.commit(&top, ["./mid"], &Artifact::new("top")).unwrap();
    cache.commit(&unrelated, no_imports(), &Artifact::new("u")).unwrap();

    fs::remove_file(&leaf).unwrap();
    let report = cache.verify_and_sweep().unwrap();

    assert_eq!(report.evicted, vec![mid.clone(), top.clone()]);
    assert!(cache.load_artifact(&mid).is_none());
    assert!(cache.load_artifact(&top).is_none());
    assert!(cache.load_artifact(&unrelated).is_some());
    assert!(cache.graph().dependents_of(&leaf).is_empty());
    assert!(cache.graph().dependencies().is_empty());
}

#[test]
fn sweep_results_are_persisted() {
    let (dir, config) = project();
    let dep = write(dir.path(), "dep.js", "");
    let main = write(dir.path(), "main.js", "import './dep'");
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        cache.commit(&main, ["./dep"], &Artifact::new("out")).unwrap();
        cache.save().unwrap();
        fs::remove_file(&dep).unwrap();
        cache.verify_and_sweep().unwrap();
    }

    let reopened = Cache::open(config, &[]).unwrap();
    assert!(!reopened.index().contains(&main));
    assert!(reopened.graph().dependencies().is_empty());
}

#[test]
fn lost_record_does_not_leave_stale_edges() {
    let (dir, config) = project();
    let old = write(dir.path(), "old.js", "");
    let new = write(dir.path(), "new.js", "");
    let main = write(dir.path(), "main.js", "import './old'");
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        cache.commit(&main, ["./old"], &Artifact::new("out")).unwrap();
        cache.save().unwrap();
        let id = cache.index().id_of(&main).unwrap();
        fs::remove_file(cache.store().records().record_path(&id)).unwrap();
    }

    let cache = Cache::open(config, &[]).unwrap();
    assert!(cache.is_stale(&main));
    fs::write(&main, "import './new'").unwrap();
    cache.commit(&main, ["./new"], &Artifact::new("out")).unwrap();
    assert!(cache.graph().dependents_of(&old).is_empty());

    fs::remove_file(&old).unwrap();
    let report = cache.verify_and_sweep().unwrap();
    assert!(report.evicted.is_empty());
    assert!(!cache.is_stale(&main));
    assert!(cache.graph().dependents_of(&new).contains(&main));
}

// ===========================================================================
// Persistence
// ===========================================================================

#[test]
fn save_and_reload_reproduces_tables() {
    let (dir, config) = project();
    let root = dir.path();
    let main = write(root, "src/main.js", "");
    write(root, "src/a.js", "");
    write(root, "node_modules/pkg/index.js", "");

    let (ids, dependents, record) = {
        let cache = Cache::open(config.clone(), &[&Plugin("p", "1")]).unwrap();
        cache.commit(&main, ["./a", "pkg"], &Artifact::new("out")).unwrap();
        cache.save().unwrap();
        let ids = cache.store().ids().read().clone();
        let dependents = cache.store().dependents().read().clone();
        let record = cache.index().record(&main).unwrap();
        (ids, dependents, record)
    };

    let cache = Cache::open(config, &[&Plugin("p", "1")]).unwrap();
    assert_eq!(*cache.store().ids().read(), ids);
    assert_eq!(*cache.store().dependents().read(), dependents);
    assert_eq!(cache.index().record(&main), Some(record));
    assert!(!cache.is_stale(&main));
}

#[cfg(unix)]
#[test]
fn non_utf8_path_does_not_block_saving_others() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let (dir, config) = project();
    let good = write(dir.path(), "good.js", "");
    let bad = dir.path().join(OsStr::from_bytes(b"bad\xff.js"));
    fs::write(&bad, "").unwrap();
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        cache.commit(&good, no_imports(), &Artifact::new("good")).unwrap();
        let err = cache
            .commit(&bad, no_imports(), &Artifact::new("bad"))
            .unwrap_err();
        assert!(matches!(err, CacheError::NonUtf8Path { .. }));
        cache.save().unwrap();
        cache.save().unwrap();
    }

    let cache = Cache::open(config, &[]).unwrap();
    assert!(!cache.is_stale(&good));
    assert!(cache.is_stale(&bad));
    assert_eq!(cache.index().len(), 1);
}

#[test]
fn unsaved_changes_are_not_persisted() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "");
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
    }
    let cache = Cache::open(config, &[]).unwrap();
    assert!(cache.is_stale(&main));
}

#[test]
fn version_change_discards_cache() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "");
    {
        let cache = Cache::open_with_version(config.clone(), &[], "1.0.0").unwrap();
        cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
        cache.save().unwrap();
    }

    let cache = Cache::open_with_version(config, &[], "2.0.0").unwrap();
    assert!(cache.index().is_empty());
    assert!(cache.is_stale(&main));
    assert!(cache.load_artifact(&main).is_none());
}

#[test]
fn version_change_keeps_project_files_in_shared_dir() {
    let (dir, mut config) = project();
    config.cache.dir = dir.path().to_path_buf();
    let main = write(dir.path(), "main.js", "");
    let util = write(dir.path(), "src/util.js", "");
    {
        let cache = Cache::open_with_version(config.clone(), &[], "1.0.0").unwrap();
        cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
        cache.save().unwrap();
    }

    let cache = Cache::open_with_version(config, &[], "2.0.0").unwrap();
    assert!(cache.index().is_empty());
    assert!(main.exists());
    assert!(util.exists());
}

#[test]
fn saving_alongside_commits_loses_nothing() {
    let (dir, config) = project();
    let files: Vec<PathBuf> = (0..32)
        .map(|i| write(dir.path(), &format!("m{i}.js"), "import './shared'"))
        .collect();
    let shared = write(dir.path(), "shared.js", "export {}");
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            let saver = scope.spawn(|| {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    cache.save().unwrap();
                }
            });
            let committers: Vec<_> = files
                .chunks(8)
                .map(|chunk| {
                    let cache = &cache;
                    scope.spawn(move || {
                        for file in chunk {
                            cache.commit(file, ["./shared"], &Artifact::new("out")).unwrap();
                        }
                    })
                })
                .collect();
            for committer in committers {
                committer.join().unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
            saver.join().unwrap();
        });
        cache.save().unwrap();
        assert!(!cache.store().is_dirty());
    }

    let cache = Cache::open(config, &[]).unwrap();
    assert_eq!(cache.index().len(), files.len());
    assert_eq!(cache.graph().dependents_of(&shared).len(), files.len());
    for file in &files {
        assert!(!cache.is_stale(file), "{} should be fresh", file.display());
        assert!(cache.load_artifact(file).is_some());
    }
}

#[test]
fn corrupt_tables_read_as_empty() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "");
    let cache_dir = config.cache_dir();
    {
        let cache = Cache::open(config.clone(), &[]).unwrap();
        cache.commit(&main, no_imports(), &Artifact::new("out")).unwrap();
        cache.save().unwrap();
    }
    fs::write(cache_dir.join("cache_id_map.json"), "{ not json").unwrap();

    let cache = Cache::open(config, &[]).unwrap();
    assert!(cache.index().is_empty());
    assert!(cache.is_stale(&main));
}

// ===========================================================================
// Resolution through the cache
// ===========================================================================

#[test]
fn commit_uses_project_resolution_rules() {
    let (dir, mut config) = project();
    let root = dir.path();
    config.resolve = ResolveConfig::default().with_alias("short", "long-name");
    let main = write(root, "main.js", "import 'short'");
    let target = write(root, "node_modules/long-name/index.js", "");

    let cache = Cache::open(config, &[]).unwrap();
    assert_eq!(cache.resolve(&main, "short").unwrap(), target);

    let outcome = cache.commit(&main, ["short"], &Artifact::new("out")).unwrap();
    assert_eq!(outcome.dependencies, vec![target.clone()]);
    assert!(outcome.unresolved.is_empty());
    assert!(cache.graph().dependents_of(&target).contains(&main));
}

#[test]
fn unresolved_imports_do_not_fail_commit() {
    let (dir, config) = project();
    let main = write(dir.path(), "main.js", "import 'nope'");
    let cache = Cache::open(config, &[]).unwrap();

    let outcome = cache
        .commit(&main, ["nope", "./also-missing"], &Artifact::new("out"))
        .unwrap();
    assert!(outcome.dependencies.is_empty());
    assert_eq!(outcome.unresolved.len(), 2);
    assert!(!cache.is_stale(&main));
}
