//! End-to-end table behaviour: CRUD, indexes and their consistency

use photonlite::error::{Error, Result};
use photonlite::{Database, DatabaseConfig, Datum, Document, IndexOptions, KeySpec, Oid, Query};
use serde_json::json;
use std::collections::BTreeSet;

fn open(dir: &std::path::Path) -> Result<Database> {
    Database::open(dir, DatabaseConfig::default())
}

fn names(docs: &[Document]) -> Vec<String> {
    docs.iter()
        .filter_map(|d| d.get("name").and_then(|n| n.as_str()).map(str::to_string))
        .collect()
}

#[test]
fn test_basic_crud_scenario() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;

    let (o1, o2) = db.write(|scope| {
        let o1 = people.append(scope, json!({"name": "Tom", "age": 21}))?;
        let o2 = people.append(scope, json!({"name": "Harry", "age": 19}))?;
        people.ensure(scope, "by_age", "{age}", false, false)?;
        Ok((o1, o2))
    })?;
    assert_eq!(o1, Oid::Int(1));
    assert_eq!(o2, Oid::Int(2));

    let found = db.read(|scope| {
        people
            .seek(scope, Query::new().index("by_age"), &Document::from(json!({"age": 19})))?
            .collect::<Result<Vec<_>>>()
    })?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, Datum::from(json!({"name": "Harry", "age": 19})));
    assert_eq!(found[0].oid, Some(o2));

    assert_eq!(db.write(|scope| people.delete(scope, o1))?, 1);
    let all = db.read(|scope| people.find(scope, Query::new())?.collect::<Result<Vec<_>>>())?;
    assert_eq!(names(&all), vec!["Harry"]);
    assert_eq!(db.read(|scope| people.get(scope, o1))?, None);
    Ok(())
}

#[test]
fn test_unique_index_rejects_duplicate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;

    db.write(|scope| {
        people.ensure(scope, "by_name", "{name}", false, false)?;
        people.append(scope, json!({"name": "Tom", "age": 21}))
    })?;

    let second = db.write(|scope| people.append(scope, json!({"name": "Tom", "age": 40})));
    assert!(matches!(second, Err(Error::DuplicateKey { .. })));

    db.read(|scope| {
        assert_eq!(people.records(scope)?, 1);
        let entries = people
            .seek_keys(scope, Query::new().index("by_name"), &Document::from(json!({"name": "Tom"})))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "Tom");
        assert_eq!(entries[0].oid, Oid::Int(1));
        Ok(())
    })
}

#[test]
fn test_conflict_inside_scope_can_be_handled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;

    // the closure recovers from the conflict and the rest commits
    let inserted = db.write(|scope| {
        people.ensure(scope, "by_name", "{name}", false, false)?;
        let mut inserted = 0;
        for name in ["Tom", "Tom", "Ann"] {
            match people.append(scope, json!({ "name": name })) {
                Ok(_) => inserted += 1,
                Err(Error::DuplicateKey { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    })?;
    assert_eq!(inserted, 2);
    assert_eq!(db.read(|scope| people.records(scope))?, 2);
    Ok(())
}

#[test]
fn test_reindex_after_force() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let items = db.table("items")?;

    db.write(|scope| {
        for n in 0..100 {
            items.append(scope, json!({"n": n, "group": format!("g{}", n % 10)}))?;
        }
        items.ensure(scope, "idx", "{n:04}", false, false)?;
        Ok(())
    })?;

    let config = db.write(|scope| items.ensure(scope, "idx", "{group}-{n}", true, true))?;
    assert_eq!(config.key.as_deref(), Some("{group}-{n}"));
    assert!(config.dupsort);

    db.read(|scope| {
        for n in 0..100 {
            let template = Document::from(json!({"n": n, "group": format!("g{}", n % 10)}));
            let hits = items
                .seek(scope, Query::new().index("idx"), &template)?
                .collect::<Result<Vec<_>>>()?;
            assert_eq!(hits.len(), 1, "document {} not found under new key", n);
            assert_eq!(hits[0].get("n").and_then(|v| v.as_i64()), Some(n));
        }
        let old_shape = items
            .seek_keys(scope, Query::new().index("idx"), &Document::from(json!({"n": 7, "group": "0007"})))?
            .count();
        assert_eq!(old_shape, 0);

        let all: Vec<_> = items
            .find(scope, Query::new().index("idx"))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(all.len(), 100);
        Ok(())
    })
}

#[test]
fn test_ensure_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = DatabaseConfig {
        replication: true,
        ..Default::default()
    };
    let db = Database::open(dir.path(), config)?;
    let people = db.table("people")?;

    db.write(|scope| {
        people.append(scope, json!({"name": "Tom"}))?;
        people.ensure(scope, "by_name", "{name}", true, false)
    })?;
    let before = db.journal(0, 100)?.len();

    let again = db.write(|scope| people.ensure(scope, "by_name", "{other}", false, false))?;
    assert_eq!(again.key.as_deref(), Some("{name}"));
    // same definition, forced: rebuilt but not journaled again
    db.write(|scope| people.ensure(scope, "by_name", "{name}", true, true))?;
    assert_eq!(db.journal(0, 100)?.len(), before);
    assert_eq!(people.index_names(), vec!["by_name"]);
    Ok(())
}

#[test]
fn test_index_consistency_after_mixed_writes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let posts = db.table("posts")?;

    db.write(|scope| {
        posts.ensure(scope, "by_tag", "{*tags}", true, false)?;
        posts.ensure(scope, "by_author", "{author:lower}", true, false)?;
        posts.append(scope, json!({"author": "Ann", "tags": ["rust", "db"]}))?;
        posts.append(scope, json!({"author": "Bob", "tags": ["db"]}))?;
        posts.append(scope, json!({"author": "ann", "tags": []}))?;
        posts.append(scope, json!({"title": "anonymous"}))?;
        Ok(())
    })?;

    db.write(|scope| {
        let mut doc = posts
            .get(scope, Oid::Int(2))?
            .ok_or_else(|| Error::DocumentNotFound("2".into()))?;
        doc.set("tags", vec![Datum::from("rust"), Datum::from("go")]);
        posts.save(scope, &doc)?;
        posts.delete(scope, Oid::Int(1))?;
        Ok(())
    })?;

    db.read(|scope| {
        // recompute expected entries from the live documents
        let docs = posts.find(scope, Query::new())?.collect::<Result<Vec<_>>>()?;
        let mut expected = BTreeSet::new();
        for doc in &docs {
            if let Some(tags) = doc.get("tags").and_then(|t| t.as_array()) {
                for tag in tags {
                    expected.insert((tag.render(), doc.oid));
                }
            }
        }
        let mut actual = BTreeSet::new();
        for tag in ["rust", "db", "go"] {
            for entry in posts.seek_keys(scope, Query::new().index("by_tag"), &Document::from(json!({"tags": [tag]})))? {
                let entry = entry?;
                actual.insert((entry.key, Some(entry.oid)));
            }
        }
        assert_eq!(actual, expected);

        let by_author = posts
            .seek(scope, Query::new().index("by_author"), &Document::from(json!({"author": "ANN"})))?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(by_author.len(), 1);
        assert_eq!(by_author[0].oid, Some(Oid::Int(3)));
        Ok(())
    })
}

#[test]
fn test_save_and_delete_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;
    let oid = db.write(|scope| people.append(scope, json!({"name": "Tom"})))?;

    let no_oid = db.write(|scope| people.save(scope, &Document::from(json!({"name": "X"}))));
    assert!(matches!(no_oid, Err(Error::InvalidArgument(_))));

    let missing = db.write(|scope| people.save(scope, &Document::with_oid(99u64, json!({"name": "X"}))));
    assert!(matches!(missing, Err(Error::DocumentNotFound(_))));

    // nothing is deleted when any target is missing
    let partial = db.write(|scope| people.delete(scope, vec![oid, Oid::Int(42)]));
    assert!(matches!(partial, Err(Error::DocumentNotFound(_))));
    assert_eq!(db.read(|scope| people.records(scope))?, 1);

    let not_object = db.write(|scope| people.append(scope, Document::new(Datum::from(5))));
    assert!(matches!(not_object, Err(Error::InvalidArgument(_))));

    let taken = db.write(|scope| people.append(scope, Document::with_oid(oid, json!({"name": "Again"}))));
    assert!(matches!(taken, Err(Error::DuplicateKey { .. })));
    Ok(())
}

#[test]
fn test_first_last_and_drop_index() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;

    assert!(db.read(|scope| people.first(scope, None))?.is_none());

    db.write(|scope| {
        people.ensure(scope, "by_name", "{name}", false, false)?;
        for name in ["Mia", "Ann", "Zoe"] {
            people.append(scope, json!({ "name": name }))?;
        }
        Ok(())
    })?;

    db.read(|scope| {
        let first = people.first(scope, Some("by_name"))?.and_then(|d| d.oid);
        let last = people.last(scope, Some("by_name"))?.and_then(|d| d.oid);
        assert_eq!(first, Some(Oid::Int(2)));
        assert_eq!(last, Some(Oid::Int(3)));
        assert_eq!(people.last(scope, None)?.and_then(|d| d.oid), Some(Oid::Int(3)));
        assert!(matches!(people.first(scope, Some("nope")), Err(Error::NoSuchIndex { .. })));
        Ok(())
    })?;

    db.write(|scope| people.drop_index(scope, "by_name"))?;
    assert!(people.index_names().is_empty());
    let again = db.write(|scope| people.drop_index(scope, "by_name"));
    assert!(matches!(again, Err(Error::NoSuchIndex { .. })));

    db.close()?;
    db.reopen()?;
    let people = db.table("people")?;
    assert!(people.index_names().is_empty());
    assert_eq!(db.read(|scope| people.records(scope))?, 3);
    Ok(())
}

#[test]
fn test_native_key_function() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    db.register_key_fn("initial", |doc| {
        doc.get("name")
            .and_then(|n| n.as_str())
            .and_then(|n| n.chars().next())
            .map(|c| vec![c.to_string()])
            .unwrap_or_default()
    })?;
    let people = db.table("people")?;

    db.write(|scope| {
        people.ensure(scope, "by_initial", KeySpec::native("initial"), true, false)?;
        for name in ["Tom", "Tim", "Ann"] {
            people.append(scope, json!({ "name": name }))?;
        }
        Ok(())
    })?;

    let t_names = db.read(|scope| {
        people
            .seek(scope, Query::new().index("by_initial"), &Document::from(json!({"name": "T"})))?
            .collect::<Result<Vec<_>>>()
    })?;
    assert_eq!(names(&t_names), vec!["Tom", "Tim"]);

    let unknown = db.write(|scope| people.ensure(scope, "other", KeySpec::native("missing"), false, false));
    assert!(matches!(unknown, Err(Error::UnknownKeyFunction(_))));
    Ok(())
}

#[test]
fn test_drop_table() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;
    db.write(|scope| {
        people.ensure(scope, "by_name", "{name}", false, false)?;
        people.append(scope, json!({"name": "Tom"}))
    })?;

    db.drop("people")?;
    assert!(!db.exists("people")?);
    assert_eq!(db.tables(true)?, vec!["__metadata__"]);

    // the name can be reused from scratch
    let people = db.table("people")?;
    assert!(people.index_names().is_empty());
    let oid = db.write(|scope| people.append(scope, json!({"name": "New"})))?;
    assert_eq!(oid, Oid::Int(1));
    Ok(())
}

fn replicated(dir: &std::path::Path) -> Result<Database> {
    let config = DatabaseConfig {
        replication: true,
        ..Default::default()
    };
    Database::open(dir, config)
}

#[test]
fn test_oversized_index_key_leaves_table_untouched() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = replicated(dir.path())?;
    let people = db.table("people")?;
    let long = "x".repeat(600);

    let tom = db.write(|scope| {
        people.ensure(scope, "by_name", "{name}", true, false)?;
        people.append(scope, json!({"name": "Tom"}))
    })?;
    let before = db.journal(0, 100)?.len();

    db.write(|scope| {
        let appended = people.append(scope, json!({ "name": long }));
        assert!(matches!(appended, Err(Error::KeyTooLarge { size: 600, .. })));
        let saved = people.save(scope, &Document::with_oid(tom, json!({ "name": long })));
        assert!(matches!(saved, Err(Error::KeyTooLarge { .. })));
        people.append(scope, json!({"name": "Ann"}))
    })?;

    db.read(|scope| {
        assert_eq!(people.records(scope)?, 2);
        let indexed = people.find(scope, Query::new().index("by_name"))?.collect::<Result<Vec<_>>>()?;
        assert_eq!(names(&indexed), vec!["Ann", "Tom"]);
        Ok(())
    })?;
    let journal = db.journal(0, 100)?;
    assert_eq!(journal.len(), before + 1);
    assert_eq!(journal[before].payload["doc"]["name"], "Ann");
    Ok(())
}

#[test]
fn test_failed_unique_ensure_writes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = replicated(dir.path())?;
    let people = db.table("people")?;

    db.write(|scope| {
        people.append(scope, json!({"name": "Tom"}))?;
        people.append(scope, json!({"name": "Tom"}))
    })?;
    let before = db.journal(0, 100)?.len();

    db.write(|scope| {
        let ensured = people.ensure(scope, "by_name", "{name}", false, false);
        assert!(matches!(ensured, Err(Error::DuplicateKey { .. })));
        people.append(scope, json!({"name": "Zed"}))
    })?;
    assert!(people.index_names().is_empty());
    assert_eq!(db.journal(0, 100)?.len(), before + 1);

    db.close()?;
    db.reopen()?;
    let people = db.table("people")?;
    assert!(people.index_names().is_empty());
    assert_eq!(db.read(|scope| people.records(scope))?, 3);

    // a later ensure still sees every document
    db.write(|scope| people.ensure(scope, "by_name", "{name}", true, false))?;
    let zed = db.read(|scope| {
        let template = Document::from(json!({"name": "Zed"}));
        Ok(people.seek(scope, Query::new().index("by_name"), &template)?.count())
    })?;
    assert_eq!(zed, 1);
    Ok(())
}

#[test]
fn test_overwrite_index_reassigns_colliding_keys() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open(dir.path())?;
    let people = db.table("people")?;
    let overwrite = IndexOptions {
        overwrite: true,
        ..Default::default()
    };

    let (first, second) = db.write(|scope| {
        people.ensure_with(scope, "by_name", "{name}", overwrite)?;
        let first = people.append(scope, json!({"name": "Tom", "age": 1}))?;
        let second = people.append(scope, json!({"name": "Tom", "age": 2}))?;
        Ok((first, second))
    })?;

    let tom = Document::from(json!({"name": "Tom"}));
    let holders = |db: &Database| -> Result<Vec<Oid>> {
        db.read(|scope| {
            people
                .seek_keys(scope, Query::new().index("by_name"), &tom)?
                .map(|entry| entry.map(|e| e.oid))
                .collect()
        })
    };
    assert_eq!(holders(&db)?, vec![second]);
    assert_eq!(db.read(|scope| people.records(scope))?, 2);

    // removing the displaced document leaves the new holder in place
    db.write(|scope| people.delete(scope, first))?;
    assert_eq!(holders(&db)?, vec![second]);

    // an overwrite index over existing duplicates keeps the last one filled
    let items = db.table("items")?;
    let last = db.write(|scope| {
        items.append(scope, json!({"name": "Tom"}))?;
        let last = items.append(scope, json!({"name": "Tom"}))?;
        items.ensure_with(scope, "by_name", "{name}", overwrite)?;
        Ok(last)
    })?;
    let filled = db.read(|scope| {
        items
            .seek_keys(scope, Query::new().index("by_name"), &tom)?
            .map(|entry| entry.map(|e| e.oid))
            .collect::<Result<Vec<_>>>()
    })?;
    assert_eq!(filled, vec![last]);
    Ok(())
}
