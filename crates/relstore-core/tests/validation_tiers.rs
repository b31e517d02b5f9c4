//! # Validation Tier Tests (T0-T5)
//!
//! If ANY tier fails, the store is INVALID.
//!
//! ## Tiers
//! - T0: Schema Assembly
//! - T1: Identity & Insert
//! - T2: Reconciliation
//! - T3: Relation Symmetry
//! - T4: Deletion
//! - T5: Update Cycle (derived fields, hooks, batching)

use relstore_core::{Field, IdentityExpr, Model, RecordRef, Store, StoreError};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&hits), hits)
}

fn hits(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Tag ⇄ Todo, both to-many with declared inverses.
fn tags_and_todos() -> Store {
    Store::builder()
        .model(
            Model::new("Tag")
                .identity("name")
                .field(Field::attr("name"))
                .field(Field::many("todos", "Todo").inverse("tags")),
        )
        .model(
            Model::new("Todo")
                .identity("id")
                .field(Field::attr("id"))
                .field(Field::attr("title"))
                .field(Field::many("tags", "Tag").inverse("todos")),
        )
        .build()
        .expect("build")
}

// =============================================================================
// TIER T0: SCHEMA ASSEMBLY
// =============================================================================

mod t0_schema_assembly {
    use super::*;

    /// T0.1: Duplicate model names are fatal.
    #[test]
    fn duplicate_model_rejected() {
        let result = Store::builder()
            .model(Model::new("A").field(Field::attr("x")))
            .model(Model::new("A").field(Field::attr("y")))
            .build();
        assert!(matches!(result, Err(StoreError::DuplicateModel(_))));
    }

    /// T0.2: A relation to an unknown model is fatal.
    #[test]
    fn unknown_target_rejected() {
        let result = Store::builder()
            .model(Model::new("A").field(Field::one("b", "B")))
            .build();
        assert!(matches!(result, Err(StoreError::UnknownTarget { .. })));
    }

    /// T0.3: An inverse that does not point back is fatal at build time.
    #[test]
    fn mismatched_inverse_rejected() {
        let result = Store::builder()
            .model(Model::new("A").field(Field::many("bs", "B").inverse("a")))
            .model(Model::new("B").field(Field::one("a", "A").inverse("others")))
            .build();
        assert!(matches!(result, Err(StoreError::InverseMismatch { .. })));
    }

    /// T0.4: Every relation with an inverse is forced eager.
    #[test]
    fn inverse_relations_are_eager() {
        let store = tags_and_todos();
        for model in store.schema().models() {
            for field in model.fields().filter(|f| f.inverse_name().is_some()) {
                assert!(field.is_eager(), "{}.{}", model.name(), field.name());
            }
        }
    }
}

// =============================================================================
// TIER T1: IDENTITY & INSERT
// =============================================================================

mod t1_identity_insert {
    use super::*;

    fn people() -> Store {
        Store::builder()
            .model(
                Model::new("Person")
                    .identity("ssn")
                    .field(Field::attr("ssn"))
                    .field(Field::attr("name")),
            )
            .build()
            .expect("build")
    }

    /// T1.1: Inserting the same identifying data twice yields one record.
    #[test]
    fn insert_is_idempotent() {
        let mut store = people();
        let a = store.insert("Person", json!({"ssn": "1"})).expect("first");
        let b = store.insert("Person", json!({"ssn": "1"})).expect("second");
        assert_eq!(a, b);
        assert_eq!(store.count("Person").expect("count"), 1);
    }

    /// T1.2: Attributes are last-write-wins per field.
    #[test]
    fn last_write_wins() {
        let mut store = people();
        store
            .insert("Person", json!({"ssn": "1", "name": "Ann"}))
            .expect("first");
        let id = store
            .insert("Person", json!({"ssn": "1", "name": "Annie"}))
            .expect("second");
        assert_eq!(store.count("Person").expect("count"), 1);
        assert_eq!(store.value(id, "name").expect("name"), json!("Annie"));
    }

    /// T1.3: Shorthand is rejected when two single-field clauses exist.
    #[test]
    fn ambiguous_shorthand_rejected() {
        let mut store = Store::builder()
            .model(
                Model::new("Contact")
                    .identity(IdentityExpr::or(["email", "phone"]))
                    .field(Field::attr("email"))
                    .field(Field::attr("phone")),
            )
            .build()
            .expect("build");
        let result = store.insert("Contact", json!("a@x"));
        assert!(matches!(result, Err(StoreError::IdentityShorthand(_))));
    }

    /// T1.4: A singleton model holds exactly one record.
    #[test]
    fn singleton_is_unique() {
        let mut store = Store::builder()
            .model(Model::new("Settings").singleton().field(Field::attr("theme")))
            .build()
            .expect("build");
        let a = store.insert("Settings", json!({"theme": "dark"})).expect("a");
        let b = store.insert("Settings", json!({"theme": "light"})).expect("b");
        assert_eq!(a, b);
        assert_eq!(store.value(a, "theme").expect("theme"), json!("light"));
    }

    /// T1.5: Candidate enumeration beyond the cap is fatal.
    #[test]
    fn candidate_overflow_is_fatal() {
        let mut store = Store::builder()
            .options(relstore_core::StoreOptions {
                max_identity_candidates: 1,
                ..Default::default()
            })
            .model(
                Model::new("Contact")
                    .identity(IdentityExpr::or(["email", "phone"]))
                    .field(Field::attr("email"))
                    .field(Field::attr("phone")),
            )
            .build()
            .expect("build");
        let result = store.insert("Contact", json!({"email": "a@x", "phone": "555"}));
        assert!(matches!(result, Err(StoreError::TooManyCandidates { .. })));
    }

    /// T1.6: Get never creates.
    #[test]
    fn get_does_not_create() {
        let store = people();
        assert_eq!(store.get("Person", json!({"ssn": "9"})).expect("get"), None);
        assert_eq!(store.count("Person").expect("count"), 0);
    }
}

// =============================================================================
// TIER T2: RECONCILIATION
// =============================================================================

mod t2_reconciliation {
    use super::*;

    fn contacts() -> Store {
        Store::builder()
            .model(
                Model::new("Contact")
                    .identity(IdentityExpr::or(["email", "phone"]))
                    .field(Field::attr("email"))
                    .field(Field::attr("phone"))
                    .field(Field::attr("name")),
            )
            .model(
                Model::new("Group")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::many("members", "Contact")),
            )
            .build()
            .expect("build")
    }

    /// T2.1: Records discovered to share an identity merge.
    #[test]
    fn partial_identities_merge() {
        let mut store = contacts();
        let r1 = store.insert("Contact", json!({"email": "a@x"})).expect("r1");
        let r2 = store.insert("Contact", json!({"phone": "555"})).expect("r2");
        assert_ne!(r1, r2);

        store.update(r1, json!({"phone": "555"})).expect("update");

        assert!(store.eq(r1, r2));
        let by_email = store.get("Contact", json!({"email": "a@x"})).expect("get");
        let by_phone = store.get("Contact", json!({"phone": "555"})).expect("get");
        assert_eq!(by_email, by_phone);
        assert_eq!(store.count("Contact").expect("count"), 1);
        store.check_integrity().expect("integrity");
    }

    /// T2.2: References to the absorbed record follow the merge.
    #[test]
    fn referencers_are_repointed() {
        let mut store = contacts();
        let r1 = store.insert("Contact", json!({"email": "a@x"})).expect("r1");
        let r2 = store.insert("Contact", json!({"phone": "555"})).expect("r2");
        let group = store
            .insert("Group", json!({"name": "g", "members": [{"email": "a@x"}, {"phone": "555"}]}))
            .expect("group");

        store.update(r2, json!({"email": "a@x"})).expect("merge");

        let members = store.records(group, "members").expect("members");
        assert_eq!(members.len(), 1);
        assert!(store.eq(members[0], r1));
        let usages = store.usages(r1).expect("usages");
        assert_eq!(usages, vec![(group, "members".to_string(), 1)]);
        store.check_integrity().expect("integrity");
    }

    /// T2.3: The record already holding the key survives and answers to
    /// both local ids; unwritten fields keep the survivor's value.
    #[test]
    fn record_found_survives() {
        let mut store = contacts();
        let r1 = store
            .insert("Contact", json!({"email": "a@x", "name": "Ann"}))
            .expect("r1");
        let r2 = store.insert("Contact", json!({"phone": "555"})).expect("r2");
        store.update(r2, json!({"email": "a@x"})).expect("merge");

        let survivor = store.canonical(r2).expect("live");
        assert_eq!(survivor, r1);
        assert_eq!(store.local_ids(r2).expect("ids"), vec![r1, r2]);
        assert_eq!(store.value(r2, "phone").expect("phone"), json!("555"));
        assert_eq!(store.value(r2, "name").expect("name"), json!("Ann"));
    }
}

// =============================================================================
// TIER T3: RELATION SYMMETRY
// =============================================================================

mod t3_relation_symmetry {
    use super::*;

    fn library() -> Store {
        Store::builder()
            .model(
                Model::new("Author")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(
                        Field::many("books", "Book")
                            .inverse("author")
                            .sort_by(|ctx, a, b| {
                                let a = ctx.get_of(a, "title")?;
                                let b = ctx.get_of(b, "title")?;
                                Ok(a.as_str().cmp(&b.as_str()))
                            }),
                    ),
            )
            .model(
                Model::new("Book")
                    .identity("isbn")
                    .field(Field::attr("isbn"))
                    .field(Field::attr("title"))
                    .field(Field::one("author", "Author").inverse("books")),
            )
            .build()
            .expect("build")
    }

    /// T3.1: Writing either side keeps both sides symmetric.
    #[test]
    fn inverse_symmetry_holds() {
        let mut store = tags_and_todos();
        let tag = store
            .insert("Tag", json!({"name": "t", "todos": [{"id": 1}, {"id": 2}]}))
            .expect("tag");
        let todo = store.get("Todo", json!(1)).expect("get").expect("todo");
        assert_eq!(store.records(todo, "tags").expect("tags"), vec![tag]);

        store
            .insert("Todo", json!({"id": 3, "tags": ["t", "u"]}))
            .expect("todo");
        assert_eq!(store.records(tag, "todos").expect("todos").len(), 3);
        store.check_integrity().expect("integrity");
    }

    /// T3.2: Setting a to-one relation evicts the previous occupant.
    #[test]
    fn to_one_evicts_previous() {
        let mut store = library();
        let book = store
            .insert("Book", json!({"isbn": "1", "title": "A", "author": "Ann"}))
            .expect("book");
        let ann = store.record(book, "author").expect("author").expect("ann");

        store.update(book, json!({"author": "Bob"})).expect("move");
        let bob = store.record(book, "author").expect("author").expect("bob");
        assert_ne!(ann, bob);
        assert!(store.records(ann, "books").expect("books").is_empty());
        assert_eq!(store.records(bob, "books").expect("books"), vec![book]);
        store.check_integrity().expect("integrity");
    }

    /// T3.3: Relation commands add and remove with the inverse in step.
    #[test]
    fn commands_keep_inverse() {
        let mut store = tags_and_todos();
        let todo = store.insert("Todo", json!({"id": 1})).expect("todo");
        store
            .update(todo, json!({"tags": [["ADD", ["a", "b"]]]}))
            .expect("add");
        let a = store.get("Tag", json!("a")).expect("get").expect("a");
        assert_eq!(store.records(a, "todos").expect("todos"), vec![todo]);

        store
            .update(todo, json!({"tags": [["DELETE", "a"], ["ADD", "c"]]}))
            .expect("delete");
        assert!(store.records(a, "todos").expect("todos").is_empty());
        assert_eq!(store.records(todo, "tags").expect("tags").len(), 2);

        store.update(todo, json!({"tags": null})).expect("clear");
        assert!(store.records(todo, "tags").expect("tags").is_empty());
        store.check_integrity().expect("integrity");
    }

    /// T3.4: DELETE never creates the record it names.
    #[test]
    fn delete_command_does_not_create() {
        let mut store = tags_and_todos();
        let todo = store.insert("Todo", json!({"id": 1})).expect("todo");
        store
            .update(todo, json!({"tags": [["DELETE", "ghost"]]}))
            .expect("delete");
        assert_eq!(store.count("Tag").expect("count"), 0);
    }

    /// T3.5: Positional writes allow duplicates and track multiplicity.
    #[test]
    fn positional_writes_track_multiplicity() {
        let mut store = tags_and_todos();
        let todo = store.insert("Todo", json!({"id": 1})).expect("todo");
        let a = store.insert("Tag", json!({"name": "a"})).expect("a");

        let mut tags = store.relation(todo, "tags").expect("relation");
        tags.push(a).expect("push");
        tags.push(a).expect("push again");
        tags.unshift(json!("b")).expect("unshift");
        assert_eq!(tags.len().expect("len"), 3);

        assert_eq!(store.usages(a).expect("usages"), vec![(todo, "tags".to_string(), 2)]);
        assert_eq!(store.records(a, "todos").expect("todos"), vec![todo]);
        store.check_integrity().expect("integrity");

        let mut tags = store.relation(todo, "tags").expect("relation");
        assert_eq!(tags.pop().expect("pop"), Some(a));
        assert_eq!(store.records(a, "todos").expect("todos"), vec![todo]);

        let mut tags = store.relation(todo, "tags").expect("relation");
        let removed = tags
            .splice(0, 2, vec![RecordRef::Data(json!("c"))])
            .expect("splice");
        assert_eq!(removed.len(), 2);
        assert!(store.records(a, "todos").expect("todos").is_empty());
        store.check_integrity().expect("integrity");
    }

    /// T3.6: A record comparator keeps the list ordered as titles change.
    #[test]
    fn sorted_relation_follows_dependencies() {
        let mut store = library();
        let ann = store
            .insert(
                "Author",
                json!({"name": "Ann", "books": [
                    {"isbn": "1", "title": "b"},
                    {"isbn": "2", "title": "a"},
                    {"isbn": "3", "title": "c"},
                ]}),
            )
            .expect("insert");
        let titles = |store: &mut Store| -> Vec<serde_json::Value> {
            let books = store.records(ann, "books").expect("books");
            books
                .into_iter()
                .map(|book| store.value(book, "title").expect("title"))
                .collect()
        };
        assert_eq!(titles(&mut store), vec![json!("a"), json!("b"), json!("c")]);

        let first = store.get("Book", json!("2")).expect("get").expect("book");
        store.update(first, json!({"title": "z"})).expect("rename");
        assert_eq!(titles(&mut store), vec![json!("b"), json!("c"), json!("z")]);
    }

    /// T3.7: The inverse-suppressed commands leave the peer untouched.
    #[test]
    fn no_inverse_commands_skip_peer() {
        let mut store = tags_and_todos();
        let todo = store.insert("Todo", json!({"id": 1})).expect("todo");
        let tag = store.insert("Tag", json!({"name": "a"})).expect("tag");
        store
            .update(todo, json!({"tags": [["ADD.noinv", "a"]]}))
            .expect("add");
        assert_eq!(store.records(todo, "tags").expect("tags"), vec![tag]);
        assert!(store.records(tag, "todos").expect("todos").is_empty());

        store
            .update(todo, json!({"tags": [["DELETE.noinv", "a"]]}))
            .expect("delete");
        store.check_integrity().expect("integrity");
    }
}

// =============================================================================
// TIER T4: DELETION
// =============================================================================

mod t4_deletion {
    use super::*;

    /// T4.1: Deleting a record strips it from every inverse list.
    #[test]
    fn cascading_delete() {
        let mut store = tags_and_todos();
        let tag = store
            .insert("Tag", json!({"name": "t", "todos": [{"id": 1}, {"id": 2}]}))
            .expect("tag");
        let todos = store.records(tag, "todos").expect("todos");
        let (first, second) = (todos[0], todos[1]);

        store.delete(first).expect("delete");

        assert!(!store.exists(first));
        assert_eq!(store.records(tag, "todos").expect("todos"), vec![second]);
        assert!(store.usages(tag).expect("usages").iter().all(|(by, _, _)| *by != first));
        assert_eq!(store.get("Todo", json!(1)).expect("get"), None);
        store.check_integrity().expect("integrity");
    }

    /// T4.2: References without an inverse are cut through the usage index.
    #[test]
    fn one_way_references_are_nullified() {
        let mut store = Store::builder()
            .model(Model::new("File").identity("path").field(Field::attr("path")))
            .model(
                Model::new("Link")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::one("target", "File"))
                    .field(Field::many("mirrors", "File")),
            )
            .build()
            .expect("build");
        let link = store
            .insert(
                "Link",
                json!({"name": "l", "target": "/a", "mirrors": ["/a", "/b"]}),
            )
            .expect("link");
        let file = store.get("File", json!("/a")).expect("get").expect("file");
        assert_eq!(store.usages(file).expect("usages").len(), 2);

        store.delete(file).expect("delete");
        assert_eq!(store.record(link, "target").expect("target"), None);
        assert_eq!(store.records(link, "mirrors").expect("mirrors").len(), 1);
        store.check_integrity().expect("integrity");
    }

    /// T4.3: A delete hook can cascade into further deletions.
    #[test]
    fn hook_driven_cascade() {
        let mut store = Store::builder()
            .model(
                Model::new("Tag")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::many("todos", "Todo").inverse("tags").on_delete(
                        |ctx, _| {
                            if ctx.records("todos")?.is_empty() {
                                let tag = ctx.record();
                                ctx.store().delete(tag)?;
                            }
                            Ok(())
                        },
                    )),
            )
            .model(
                Model::new("Todo")
                    .identity("id")
                    .field(Field::attr("id"))
                    .field(Field::many("tags", "Tag").inverse("todos")),
            )
            .build()
            .expect("build");
        let tag = store
            .insert("Tag", json!({"name": "t", "todos": [{"id": 1}, {"id": 2}]}))
            .expect("tag");
        let todos = store.records(tag, "todos").expect("todos");

        store.delete(todos[0]).expect("first");
        assert!(store.exists(tag));

        store.delete(todos[1]).expect("second");
        assert!(!store.exists(tag));
        assert_eq!(store.count("Tag").expect("count"), 0);
        store.check_integrity().expect("integrity");
    }

    /// T4.4: Deletion is deferred until the outermost cycle ends.
    #[test]
    fn delete_waits_for_cycle_end() {
        let mut store = tags_and_todos();
        let todo = store.insert("Todo", json!({"id": 1, "tags": ["a"]})).expect("todo");
        store
            .with_update(|s| {
                s.delete(todo)?;
                assert!(s.exists(todo));
                assert_eq!(s.records(todo, "tags")?.len(), 1);
                Ok(())
            })
            .expect("cycle");
        assert!(!store.exists(todo));
    }
}

// =============================================================================
// TIER T5: UPDATE CYCLE
// =============================================================================

mod t5_update_cycle {
    use super::*;

    /// T5.1: A lazy field is not computed until read, then exactly once.
    #[test]
    fn lazy_field_not_invoked() {
        let (calls, seen) = counter();
        let mut store = Store::builder()
            .model(
                Model::new("Person")
                    .identity("ssn")
                    .field(Field::attr("ssn"))
                    .field(Field::attr("first"))
                    .field(Field::attr("greeting").compute(move |ctx| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let first = ctx.get("first")?;
                        Ok(json!(format!("Hello {}", first.as_str().unwrap_or(""))))
                    })),
            )
            .build()
            .expect("build");

        let id = store.insert("Person", json!({"ssn": "1", "first": "A"})).expect("insert");
        for name in ["B", "C", "D"] {
            store.update(id, json!({"first": name})).expect("update");
        }
        assert_eq!(hits(&seen), 0);

        assert_eq!(store.value(id, "greeting").expect("read"), json!("Hello D"));
        assert_eq!(hits(&seen), 1);
        assert_eq!(store.value(id, "greeting").expect("read"), json!("Hello D"));
        assert_eq!(hits(&seen), 1);

        store.update(id, json!({"first": "E"})).expect("update");
        assert_eq!(hits(&seen), 1);
        assert_eq!(store.value(id, "greeting").expect("read"), json!("Hello E"));
        assert_eq!(hits(&seen), 2);
    }

    /// T5.2: An observed lazy field recomputes within the drain.
    #[test]
    fn observed_field_recomputes_eagerly() {
        let (calls, seen) = counter();
        let mut store = Store::builder()
            .model(
                Model::new("Cart")
                    .singleton()
                    .field(Field::attr("items").default(json!([])))
                    .field(Field::attr("size").compute(move |ctx| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let items = ctx.get("items")?;
                        Ok(json!(items.as_array().map_or(0, Vec::len)))
                    })),
            )
            .build()
            .expect("build");
        let cart = store.insert("Cart", json!({})).expect("cart");
        store.observe(cart, "size").expect("observe");
        assert_eq!(hits(&seen), 1);

        store.update(cart, json!({"items": [1, 2]})).expect("update");
        assert_eq!(hits(&seen), 2);
        assert_eq!(store.take_changes(), vec![(cart, "size".to_string())]);
        assert_eq!(store.value(cart, "size").expect("size"), json!(2));
        assert_eq!(hits(&seen), 2);

        assert!(store.unobserve(cart, "size").expect("unobserve"));
        store.update(cart, json!({"items": []})).expect("update");
        assert_eq!(hits(&seen), 2);
    }

    /// T5.3: A computed relation with an inverse is eager and keeps the
    /// peer side current without being read.
    #[test]
    fn computed_inverse_is_eager() {
        let mut store = Store::builder()
            .model(
                Model::new("Dept")
                    .identity("code")
                    .field(Field::attr("code"))
                    .field(Field::many("staff", "Employee").inverse("dept")),
            )
            .model(
                Model::new("Employee")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::attr("dept_code"))
                    .field(Field::one("dept", "Dept").inverse("staff").compute(|ctx| {
                        let code = ctx.get("dept_code")?;
                        if code.is_null() {
                            return Ok(None);
                        }
                        ctx.store().get("Dept", json!({"code": code}))
                    })),
            )
            .build()
            .expect("build");
        let a = store.insert("Dept", json!({"code": "a"})).expect("a");
        let b = store.insert("Dept", json!({"code": "b"})).expect("b");

        let emp = store
            .insert("Employee", json!({"name": "x", "dept_code": "a"}))
            .expect("employee");
        assert_eq!(store.records(a, "staff").expect("staff"), vec![emp]);

        store.update(emp, json!({"dept_code": "b"})).expect("move");
        assert!(store.records(a, "staff").expect("staff").is_empty());
        assert_eq!(store.records(b, "staff").expect("staff"), vec![emp]);
        store.check_integrity().expect("integrity");
    }

    /// T5.4: A cascade through three relation hops fires each hook at most
    /// once per distinct target.
    #[test]
    fn hooks_are_batched() {
        let (city_added, cities) = counter();
        let (street_added, streets) = counter();
        let (house_added, houses) = counter();
        let (houses_updated, house_updates) = counter();
        let (house_moved, moves) = counter();

        let mut store = Store::builder()
            .model(
                Model::new("Country")
                    .identity("code")
                    .field(Field::attr("code"))
                    .field(Field::many("cities", "City").inverse("country").on_add(
                        move |_, _| {
                            city_added.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )),
            )
            .model(
                Model::new("City")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::one("country", "Country").inverse("cities"))
                    .field(Field::many("streets", "Street").inverse("city").on_add(
                        move |_, _| {
                            street_added.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )),
            )
            .model(
                Model::new("Street")
                    .identity("name")
                    .field(Field::attr("name"))
                    .field(Field::one("city", "City").inverse("streets"))
                    .field(
                        Field::many("houses", "House")
                            .inverse("street")
                            .on_add(move |_, _| {
                                house_added.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .on_update(move |_| {
                                houses_updated.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }),
                    ),
            )
            .model(
                Model::new("House")
                    .identity("num")
                    .field(Field::attr("num"))
                    .field(Field::one("street", "Street").inverse("houses"))
                    .on_change(["street"], move |_| {
                        house_moved.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
            )
            .build()
            .expect("build");

        let data = json!({"code": "fr", "cities": [{"name": "paris", "streets": [
            {"name": "main", "houses": [{"num": 1}, {"num": 2}, {"num": 3}]}
        ]}]});
        store.insert("Country", data.clone()).expect("insert");

        assert_eq!(hits(&cities), 1);
        assert_eq!(hits(&streets), 1);
        assert_eq!(hits(&houses), 3);
        assert_eq!(hits(&house_updates), 1);
        assert_eq!(hits(&moves), 3);

        store.insert("Country", data).expect("again");
        assert_eq!(hits(&houses), 3);
        assert_eq!(hits(&house_updates), 1);
        store.check_integrity().expect("integrity");
    }

    /// T5.5: Hooks see the fully propagated state and may write.
    #[test]
    fn hooks_can_write_in_the_same_cycle() {
        let mut store = Store::builder()
            .model(
                Model::new("Thread")
                    .identity("id")
                    .field(Field::attr("id"))
                    .field(Field::attr("count").default(json!(0)))
                    .field(Field::many("messages", "Message").inverse("thread").on_add(
                        |ctx, _| {
                            let count = ctx.records("messages")?.len();
                            let id = ctx.record();
                            ctx.update(id, json!({"count": count}))
                        },
                    )),
            )
            .model(
                Model::new("Message")
                    .identity("id")
                    .field(Field::attr("id"))
                    .field(Field::one("thread", "Thread").inverse("messages")),
            )
            .build()
            .expect("build");
        store
            .insert_many(
                "Message",
                vec![json!({"id": 1, "thread": 7}), json!({"id": 2, "thread": 7})],
            )
            .expect("insert");
        let thread = store.get("Thread", json!(7)).expect("get").expect("thread");
        assert_eq!(store.value(thread, "count").expect("count"), json!(2));
    }
}
