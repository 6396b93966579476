//! Resolution engine integration tests
//!
//! Exercise the engine end to end against the in-memory store.
//! Run with: cargo test --test role_override_test

use std::sync::Arc;
use std::time::Duration;

use rolegate::{
    Account, AccountId, AppliesTo, BaseRoleType, Collaborators, Context, Course, CourseId,
    EngineConfig, Error, Group, GroupId, MemoryStore, OverrideChange, PermissionEngine,
    PluginRegistry, ResolveOptions, ResolvedPermission, Role, RoleOverride, ShardId,
};

fn engine_with(
    store: &Arc<MemoryStore>,
    plugins: &Arc<PluginRegistry>,
    config: EngineConfig,
) -> PermissionEngine {
    PermissionEngine::new(
        Collaborators::from_store(store.clone(), plugins.clone()),
        config,
    )
}

fn engine(store: &Arc<MemoryStore>) -> PermissionEngine {
    engine_with(store, &Arc::new(PluginRegistry::new()), EngineConfig::default())
}

fn at(account: &Account) -> Context {
    Context::Account(account.id)
}

async fn resolve(
    engine: &PermissionEngine,
    context: Context,
    permission: &str,
    role: &Role,
) -> ResolvedPermission {
    engine
        .permission_for(context, permission, role, ResolveOptions::default())
        .await
        .unwrap()
}

async fn resolve_as(
    engine: &PermissionEngine,
    context: Context,
    permission: &str,
    role: &Role,
    role_context: Context,
) -> ResolvedPermission {
    engine
        .permission_for(
            context,
            permission,
            role,
            ResolveOptions::default().with_role_context(role_context),
        )
        .await
        .unwrap()
}

/// Root -> Sub -> Leaf on shard 0.
struct Tree {
    store: Arc<MemoryStore>,
    root: Account,
    sub: Account,
    leaf: Account,
}

fn tree() -> Tree {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let sub = store.create_sub_account("Science", &root);
    let leaf = store.create_sub_account("Biology Dept", &sub);
    Tree {
        store,
        root,
        sub,
        leaf,
    }
}

/// A site-admin root plus an ordinary root with one sub-account.
struct Site {
    store: Arc<MemoryStore>,
    site_admin: Account,
    root: Account,
    sub: Account,
}

fn site() -> Site {
    let store = Arc::new(MemoryStore::new());
    let site_admin = store.create_root_account("Site Admin", ShardId(0));
    let root = store.create_root_account("Default", ShardId(0));
    let sub = store.create_sub_account("Sub", &root);
    Site {
        store,
        site_admin,
        root,
        sub,
    }
}

fn site_config(site: &Site) -> EngineConfig {
    EngineConfig::default().with_site_admin(site.site_admin.id)
}

// === Inheritance ===

#[tokio::test]
async fn test_no_overrides_resolves_to_registry_defaults() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.leaf);
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    for context in [at(&t.root), at(&t.sub), at(&t.leaf), Context::Course(course.id)] {
        let r = resolve(&engine, context, "moderate_forum", &teacher).await;
        assert_eq!(r.enabled, AppliesTo::ALL, "{}", context);
        assert!(!r.explicit);
        assert!(r.prior_default);
        assert!(!r.locked);
        assert!(!r.readonly);

        let r = resolve(&engine, context, "moderate_forum", &student).await;
        assert_eq!(r.enabled, AppliesTo::NONE, "{}", context);
        assert!(!r.explicit);
        assert!(r.prior_default);
    }
}

#[tokio::test]
async fn test_first_override_found_on_ancestor() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.sub.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(!r.explicit);
    assert!(r.prior_default);
    assert_eq!(r.source_account, Some(t.sub.id));

    let r = resolve(&engine, at(&t.sub), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(r.explicit);
    assert!(!r.prior_default);
    assert_eq!(r.inherited, AppliesTo::ALL);

    let r = resolve(&engine, at(&t.root), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_custom_role_does_not_see_base_role_overrides() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let custom = t
        .store
        .create_custom_role("course role", BaseRoleType::TeacherEnrollment, &t.root);
    let engine = engine(&t.store);

    engine
        .manage_override(t.root.id, &custom, "moderate_forum", OverrideChange::enabled(true))
        .await
        .unwrap();
    engine
        .manage_override(t.root.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    assert_eq!(
        resolve(&engine, at(&t.root), "moderate_forum", &custom).await.enabled,
        AppliesTo::ALL
    );
    assert_eq!(
        resolve(&engine, at(&t.root), "moderate_forum", &teacher).await.enabled,
        AppliesTo::NONE
    );
}

#[tokio::test]
async fn test_course_uses_permission_from_parent_account() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.leaf);
    let ta = t.store.built_in_role_for(BaseRoleType::TaEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.root.id, &ta, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    let r = resolve(&engine, Context::Course(course.id), "moderate_forum", &ta).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(!r.explicit);
    assert!(!r.is_grantable());
}

// === Locking ===

#[tokio::test]
async fn test_lock_blocks_descendant_override() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.leaf.id, &teacher, "moderate_forum", OverrideChange::enabled(true))
        .await
        .unwrap();
    engine
        .manage_override(
            t.sub.id,
            &teacher,
            "moderate_forum",
            OverrideChange::new(Some(false), Some(true)),
        )
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(r.locked);
    assert!(r.readonly);
    assert!(!r.explicit);
    assert_eq!(r.source_account, Some(t.sub.id));

    let r = resolve(&engine, at(&t.sub), "moderate_forum", &teacher).await;
    assert!(r.locked);
    assert!(!r.readonly);
}

#[tokio::test]
async fn test_unlocking_restores_descendant_control() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.leaf.id, &teacher, "moderate_forum", OverrideChange::enabled(true))
        .await
        .unwrap();
    engine
        .manage_override(
            t.sub.id,
            &teacher,
            "moderate_forum",
            OverrideChange::new(Some(false), Some(true)),
        )
        .await
        .unwrap();
    assert_eq!(
        resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await.enabled,
        AppliesTo::NONE
    );

    engine
        .manage_override(
            t.sub.id,
            &teacher,
            "moderate_forum",
            OverrideChange::new(Some(false), Some(false)),
        )
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert!(r.explicit);
    assert!(!r.locked);
    assert!(!r.readonly);
    assert_eq!(r.inherited, AppliesTo::NONE);
}

// === Scope markers ===

#[tokio::test]
async fn test_descendants_only_override() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.sub);
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .save_override(
            RoleOverride::new(t.sub.id, "moderate_forum", student.id, true)
                .with_applies_to_self(false),
        )
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.sub), "moderate_forum", &student).await;
    assert_eq!(r.enabled, AppliesTo::DESCENDANTS);
    assert!(!r.is_grantable());

    assert_eq!(
        engine.enabled_for(at(&t.sub), "moderate_forum", &student).await.unwrap(),
        AppliesTo::DESCENDANTS
    );
    assert_eq!(
        engine.enabled_for(at(&t.leaf), "moderate_forum", &student).await.unwrap(),
        AppliesTo::ALL
    );
    assert_eq!(
        engine
            .enabled_for(Context::Course(course.id), "moderate_forum", &student)
            .await
            .unwrap(),
        AppliesTo::ALL
    );
}

#[tokio::test]
async fn test_self_only_override() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.sub);
    let observer = t.store.built_in_role_for(BaseRoleType::ObserverEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .save_override(
            RoleOverride::new(t.sub.id, "read_roster", observer.id, true)
                .with_applies_to_descendants(false),
        )
        .await
        .unwrap();

    assert_eq!(
        engine.enabled_for(at(&t.sub), "read_roster", &observer).await.unwrap(),
        AppliesTo::SELF
    );
    assert_eq!(
        engine.enabled_for(at(&t.leaf), "read_roster", &observer).await.unwrap(),
        AppliesTo::NONE
    );
    assert_eq!(
        engine
            .enabled_for(Context::Course(course.id), "read_roster", &observer)
            .await
            .unwrap(),
        AppliesTo::NONE
    );
}

#[tokio::test]
async fn test_locked_descendants_only_override_still_scopes_output() {
    let t = tree();
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .save_override(
            RoleOverride::new(t.sub.id, "moderate_forum", student.id, true)
                .with_applies_to_self(false)
                .with_locked(true),
        )
        .await
        .unwrap();
    engine
        .save_override(RoleOverride::new(t.leaf.id, "moderate_forum", student.id, false))
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.sub), "moderate_forum", &student).await;
    assert_eq!(r.enabled, AppliesTo::DESCENDANTS);
    let r = resolve(&engine, at(&t.leaf), "moderate_forum", &student).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert!(r.readonly);
}

// === manage_override ===

struct ManageSetup {
    store: Arc<MemoryStore>,
    engine: PermissionEngine,
    account: Account,
    role: Role,
}

fn manage_setup() -> ManageSetup {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let account = store.create_sub_account("Sub", &root);
    let role = store.create_custom_role("NewRole", BaseRoleType::AccountMembership, &account);
    let engine = engine(&store);
    ManageSetup {
        store,
        engine,
        account,
        role,
    }
}

#[tokio::test]
async fn test_manage_override_no_op_when_nothing_given() {
    let s = manage_setup();
    for _ in 0..2 {
        let result = s
            .engine
            .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::locked(false))
            .await
            .unwrap();
        assert!(result.is_none());
        let result = s
            .engine
            .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }
    assert!(s.store.overrides_on(ShardId(0)).is_empty());
}

#[tokio::test]
async fn test_manage_override_creates_with_given_value() {
    let s = manage_setup();
    let created = s
        .engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::enabled(false))
        .await
        .unwrap()
        .unwrap();
    assert!(created.is_persisted());
    assert!(!created.enabled);
    assert!(!created.locked);
    assert_eq!(s.store.overrides_on(ShardId(0)).len(), 1);
}

#[tokio::test]
async fn test_manage_override_lock_only_creates_with_registry_default() {
    let s = manage_setup();
    let created = s
        .engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::locked(true))
        .await
        .unwrap()
        .unwrap();
    assert!(created.locked);
    assert!(!created.enabled);
    assert_eq!(s.store.overrides_on(ShardId(0)).len(), 1);
}

#[tokio::test]
async fn test_manage_override_updates_only_given_fields() {
    let s = manage_setup();
    s.engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::enabled(true))
        .await
        .unwrap();

    let updated = s
        .engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::enabled(false))
        .await
        .unwrap()
        .unwrap();
    assert!(!updated.enabled);
    assert!(!updated.locked);

    s.engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::enabled(true))
        .await
        .unwrap();
    let updated = s
        .engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::locked(true))
        .await
        .unwrap()
        .unwrap();
    assert!(updated.enabled);
    assert!(updated.locked);

    let stored = s.store.overrides_on(ShardId(0));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0], updated);
}

#[tokio::test]
async fn test_manage_override_deletes_when_cleared() {
    let s = manage_setup();
    s.engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::enabled(true))
        .await
        .unwrap();
    assert_eq!(
        resolve(&s.engine, at(&s.account), "read_reports", &s.role).await.enabled,
        AppliesTo::ALL
    );

    let result = s
        .engine
        .manage_override(s.account.id, &s.role, "read_reports", OverrideChange::locked(false))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(s.store.overrides_on(ShardId(0)).is_empty());
    assert_eq!(
        resolve(&s.engine, at(&s.account), "read_reports", &s.role).await.enabled,
        AppliesTo::NONE
    );
}

#[tokio::test]
async fn test_manage_override_errors() {
    let s = manage_setup();
    let err = s
        .engine
        .manage_override(s.account.id, &s.role, "fly_to_the_moon", OverrideChange::enabled(true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPermission(_)));

    let err = s
        .engine
        .manage_override(AccountId(9999), &s.role, "read_reports", OverrideChange::enabled(true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "account", .. }));
}

// === save_override / delete_override ===

#[tokio::test]
async fn test_save_override_derives_root_account_once() {
    let t = tree();
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    let saved = engine
        .save_override(RoleOverride::new(t.sub.id, "read_forum", student.id, false))
        .await
        .unwrap();
    assert!(saved.is_persisted());
    assert_eq!(saved.root_account_id(), Some(t.root.id));

    let mut explicit = RoleOverride::new(t.leaf.id, "read_forum", student.id, false);
    explicit.assign_root_account(AccountId(999));
    let saved = engine.save_override(explicit).await.unwrap();
    assert_eq!(saved.root_account_id(), Some(AccountId(999)));
}

#[tokio::test]
async fn test_duplicate_override_is_a_conflict() {
    let t = tree();
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .save_override(RoleOverride::new(t.sub.id, "read_forum", student.id, false))
        .await
        .unwrap();
    let err = engine
        .save_override(RoleOverride::new(t.sub.id, "read_forum", student.id, true))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_delete_override_invalidates() {
    let t = tree();
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    let saved = engine
        .save_override(RoleOverride::new(t.sub.id, "read_forum", student.id, false))
        .await
        .unwrap();
    assert_eq!(
        resolve(&engine, at(&t.leaf), "read_forum", &student).await.enabled,
        AppliesTo::NONE
    );

    assert!(engine.delete_override(&saved).await.unwrap());
    assert_eq!(
        resolve(&engine, at(&t.leaf), "read_forum", &student).await.enabled,
        AppliesTo::ALL
    );
    assert!(!engine.delete_override(&saved).await.unwrap());
}

// === Caching ===

#[tokio::test]
async fn test_contexts_under_one_root_share_a_table() {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let a = store.create_sub_account("A", &root);
    let b = store.create_sub_account("B", &root);
    let teacher = store.built_in_role_for(BaseRoleType::TeacherEnrollment, root.id);
    let engine = engine(&store);

    resolve(&engine, at(&a), "moderate_forum", &teacher).await;
    resolve(&engine, at(&b), "moderate_forum", &teacher).await;
    resolve(&engine, at(&b), "read_forum", &teacher).await;
    assert_eq!(engine.computations(), 1);

    engine
        .manage_override(root.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    assert_eq!(
        resolve(&engine, at(&a), "moderate_forum", &teacher).await.enabled,
        AppliesTo::NONE
    );
    assert_eq!(
        resolve(&engine, at(&b), "moderate_forum", &teacher).await.enabled,
        AppliesTo::NONE
    );
    assert_eq!(engine.computations(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_load_once() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(20)));
    let root = store.create_root_account("Default", ShardId(0));
    let a = store.create_sub_account("A", &root);
    let b = store.create_sub_account("B", &root);
    let teacher = store.built_in_role_for(BaseRoleType::TeacherEnrollment, root.id);
    let engine = engine(&store);

    let (r1, r2, r3, r4) = tokio::join!(
        resolve(&engine, at(&a), "moderate_forum", &teacher),
        resolve(&engine, at(&b), "moderate_forum", &teacher),
        resolve(&engine, at(&a), "read_forum", &teacher),
        resolve(&engine, at(&b), "read_forum", &teacher),
    );
    for r in [r1, r2, r3, r4] {
        assert_eq!(r.enabled, AppliesTo::ALL);
    }
    assert_eq!(engine.computations(), 1);
    assert_eq!(store.override_fetch_count(), 1);
}

#[tokio::test]
async fn test_bypass_sees_uncached_truth() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine(&t.store);

    resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(engine.computations(), 1);

    let r = engine
        .permission_for(
            at(&t.leaf),
            "moderate_forum",
            &teacher,
            ResolveOptions::default().uncached(),
        )
        .await
        .unwrap();
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert_eq!(engine.computations(), 2);

    resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(engine.computations(), 2);
}

#[tokio::test]
async fn test_disabled_cache_always_recomputes() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine_with(
        &t.store,
        &Arc::new(PluginRegistry::new()),
        EngineConfig::default().without_cache(),
    );

    resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    resolve(&engine, at(&t.leaf), "moderate_forum", &teacher).await;
    assert_eq!(engine.computations(), 2);
}

#[tokio::test]
async fn test_reparenting_requires_touch() {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let a = store.create_sub_account("A", &root);
    let b = store.create_sub_account("B", &root);
    let leaf = store.create_sub_account("Leaf", &a);
    let teacher = store.built_in_role_for(BaseRoleType::TeacherEnrollment, root.id);
    let engine = engine(&store);

    engine
        .manage_override(b.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();
    assert_eq!(
        resolve(&engine, at(&leaf), "moderate_forum", &teacher).await.enabled,
        AppliesTo::ALL
    );

    store.reparent_account(leaf.id, b.id).unwrap();
    let uncached = engine
        .permission_for(
            at(&leaf),
            "moderate_forum",
            &teacher,
            ResolveOptions::default().uncached(),
        )
        .await
        .unwrap();
    assert_eq!(uncached.enabled, AppliesTo::NONE);

    engine.touch_account(leaf.id);
    assert_eq!(
        resolve(&engine, at(&leaf), "moderate_forum", &teacher).await.enabled,
        AppliesTo::NONE
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_during_table_load_is_not_served_later() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(50)));
    let site_admin = store.create_root_account("Site Admin", ShardId(0));
    let root = store.create_root_account("Default", ShardId(1));
    let support = store.create_custom_role("Support", BaseRoleType::AccountAdmin, &site_admin);
    let engine = Arc::new(engine_with(
        &store,
        &Arc::new(PluginRegistry::new()),
        EngineConfig::default().with_site_admin(site_admin.id),
    ));

    // The chain spans shards 0 and 1: shard 0 is read at 50ms, shard 1 at 100ms.
    let in_flight = tokio::spawn({
        let engine = engine.clone();
        let support = support.clone();
        let context = at(&root);
        async move { resolve(&engine, context, "moderate_forum", &support).await }
    });
    tokio::time::sleep(Duration::from_millis(75)).await;
    engine
        .manage_override(site_admin.id, &support, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();
    assert_eq!(in_flight.await.unwrap().enabled, AppliesTo::ALL);

    let r = resolve(&engine, at(&root), "moderate_forum", &support).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert_eq!(r.source_account, Some(site_admin.id));
    assert_eq!(engine.computations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_touch_during_chain_load_is_not_served_later() {
    let store = Arc::new(MemoryStore::new().with_account_latency(Duration::from_millis(50)));
    let root = store.create_root_account("Default", ShardId(0));
    let a = store.create_sub_account("A", &root);
    let b = store.create_sub_account("B", &root);
    let leaf = store.create_sub_account("Leaf", &a);
    let teacher = store.built_in_role_for(BaseRoleType::TeacherEnrollment, root.id);
    let engine = Arc::new(engine(&store));

    engine
        .manage_override(b.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    // The leaf is read at 50ms, its old parent at 100ms.
    let in_flight = tokio::spawn({
        let engine = engine.clone();
        let teacher = teacher.clone();
        let context = at(&leaf);
        async move { resolve(&engine, context, "moderate_forum", &teacher).await }
    });
    tokio::time::sleep(Duration::from_millis(75)).await;
    store.reparent_account(leaf.id, b.id).unwrap();
    engine.touch_account(leaf.id);
    assert_eq!(in_flight.await.unwrap().enabled, AppliesTo::ALL);

    let r = resolve(&engine, at(&leaf), "moderate_forum", &teacher).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert_eq!(r.source_account, Some(b.id));
}

// === Context resolution ===

#[tokio::test]
async fn test_course_id_colliding_with_account_uses_course_chain() {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let sub = store.create_sub_account("Sub", &root);
    let other = store.create_root_account("Other", ShardId(0));
    let course = store.add_course(Course::new(CourseId(other.id.0), "Twin", &sub));
    let teacher = store.built_in_role_for(BaseRoleType::TeacherEnrollment, root.id);
    let engine = engine(&store);

    engine
        .manage_override(root.id, &teacher, "moderate_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    let course_ctx = Context::Course(course.id);
    let r = resolve_as(&engine, course_ctx, "moderate_forum", &teacher, course_ctx).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(!r.explicit);
    assert_eq!(r.source_account, Some(root.id));
}

#[tokio::test]
async fn test_colliding_role_context_is_not_a_boundary() {
    let store = Arc::new(MemoryStore::new());
    let root = store.create_root_account("Default", ShardId(0));
    let sub = store.create_sub_account("Sub", &root);
    let twin = store.add_course(Course::new(CourseId(root.id.0), "Twin", &sub));
    let admin = store.built_in_role_for(BaseRoleType::AccountAdmin, root.id);
    let engine = engine(&store);

    engine
        .manage_override(sub.id, &admin, "read_reports", OverrideChange::enabled(false))
        .await
        .unwrap();

    let r = resolve_as(&engine, at(&sub), "read_reports", &admin, Context::Course(twin.id)).await;
    assert_eq!(r.enabled, AppliesTo::NONE);

    let r = resolve_as(&engine, at(&sub), "read_reports", &admin, at(&root)).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_detached_contexts_fall_back_to_defaults() {
    let t = tree();
    let group = t.store.add_group(Group {
        id: GroupId(4000),
        name: "Study Group".to_string(),
        account_id: None,
        shard: ShardId(0),
    });
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.root.id, &student, "read_forum", OverrideChange::enabled(false))
        .await
        .unwrap();

    let r = resolve(&engine, Context::Group(group.id), "read_forum", &student).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert!(r.prior_default);

    let r = resolve(&engine, Context::Course(CourseId(31337)), "read_forum", &student).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_group_under_account_inherits() {
    let t = tree();
    let group = t.store.add_group(Group {
        id: GroupId(4001),
        name: "Lab Partners".to_string(),
        account_id: Some(t.sub.id),
        shard: ShardId(0),
    });
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .manage_override(t.sub.id, &student, "view_group_pages", OverrideChange::enabled(false))
        .await
        .unwrap();
    let r = resolve(&engine, Context::Group(group.id), "view_group_pages", &student).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
}

// === Availability and account-only permissions ===

#[tokio::test]
async fn test_unavailable_permission_ignores_overrides() {
    let t = tree();
    let student = t.store.built_in_role_for(BaseRoleType::StudentEnrollment, t.root.id);
    let engine = engine(&t.store);

    engine
        .save_override(RoleOverride::new(t.root.id, "read_reports", student.id, true))
        .await
        .unwrap();

    let r = resolve(&engine, at(&t.root), "read_reports", &student).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(r.locked);
    assert!(r.readonly);
}

#[tokio::test]
async fn test_site_admin_only_permissions() {
    let s = site();
    let sa_admin = s.store.built_in_role_for(BaseRoleType::AccountAdmin, s.site_admin.id);
    let root_admin = s.store.built_in_role_for(BaseRoleType::AccountAdmin, s.root.id);
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));

    let r = resolve(&engine, at(&s.root), "manage_site_settings", &root_admin).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(r.readonly);

    let r = resolve_as(&engine, at(&s.root), "manage_site_settings", &sa_admin, at(&s.site_admin)).await;
    assert_eq!(r.enabled, AppliesTo::ALL);

    let r = resolve(&engine, at(&s.site_admin), "manage_site_settings", &sa_admin).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_custom_site_admin_role_granted_on_root_accounts() {
    let s = site();
    let custom = s
        .store
        .create_custom_role("somerole", BaseRoleType::AccountMembership, &s.site_admin);
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));

    engine
        .manage_override(s.site_admin.id, &custom, "manage_site_settings", OverrideChange::enabled(true))
        .await
        .unwrap();

    let r = resolve_as(&engine, at(&s.root), "manage_site_settings", &custom, at(&s.site_admin)).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert!(r.is_grantable());
}

#[tokio::test]
async fn test_root_only_permissions() {
    let s = site();
    let root_admin = s.store.built_in_role_for(BaseRoleType::AccountAdmin, s.root.id);
    let course = s.store.create_course("History", &s.sub);
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));

    assert_eq!(
        resolve(&engine, at(&s.root), "become_user", &root_admin).await.enabled,
        AppliesTo::ALL
    );
    assert_eq!(
        resolve(&engine, at(&s.sub), "become_user", &root_admin).await.enabled,
        AppliesTo::NONE
    );
    assert_eq!(
        resolve_as(&engine, at(&s.sub), "become_user", &root_admin, at(&s.root))
            .await
            .enabled,
        AppliesTo::ALL
    );
    assert_eq!(
        resolve_as(&engine, Context::Course(course.id), "become_user", &root_admin, at(&s.root))
            .await
            .enabled,
        AppliesTo::ALL
    );
}

#[tokio::test]
async fn test_account_only_permission_in_course_role_context() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.sub);
    let admin = t.store.built_in_role_for(BaseRoleType::AccountAdmin, t.root.id);
    let engine = engine(&t.store);

    let course_ctx = Context::Course(course.id);
    let r = resolve(&engine, course_ctx, "manage_account_settings", &admin).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(r.readonly);
}

#[tokio::test]
async fn test_sub_account_cannot_revoke_parent_grant() {
    let s = site();
    let sa_admin = s.store.built_in_role_for(BaseRoleType::AccountAdmin, s.site_admin.id);
    let root_admin = s.store.built_in_role_for(BaseRoleType::AccountAdmin, s.root.id);
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));

    engine
        .manage_override(s.sub.id, &root_admin, "allow_course_admin_actions", OverrideChange::enabled(false))
        .await
        .unwrap();

    let r = resolve_as(&engine, at(&s.sub), "allow_course_admin_actions", &sa_admin, at(&s.site_admin)).await;
    assert!(r.is_grantable());
    let r = resolve_as(&engine, at(&s.sub), "allow_course_admin_actions", &root_admin, at(&s.root)).await;
    assert!(r.is_grantable());
    assert!(r.explicit);
    let r = resolve(&engine, at(&s.sub), "allow_course_admin_actions", &root_admin).await;
    assert!(!r.is_grantable());
}

// === Account settings ===

#[tokio::test]
async fn test_account_allows_follows_root_setting() {
    let t = tree();
    let admin = t.store.built_in_role_for(BaseRoleType::AccountAdmin, t.root.id);
    let engine = engine(&t.store);

    let r = resolve(&engine, at(&t.sub), "view_notifications", &admin).await;
    assert!(!r.account_allows);
    assert_eq!(r.enabled, AppliesTo::NONE);
    assert!(!r.explicit);

    t.store
        .set_account_setting(t.root.id, "admins_can_view_notifications", serde_json::json!(true));
    let r = resolve(&engine, at(&t.sub), "view_notifications", &admin).await;
    assert!(r.account_allows);
    assert_eq!(r.enabled, AppliesTo::NONE);

    engine
        .manage_override(t.sub.id, &admin, "view_notifications", OverrideChange::enabled(true))
        .await
        .unwrap();
    let r = resolve(&engine, at(&t.sub), "view_notifications", &admin).await;
    assert!(r.is_grantable());

    t.store
        .set_account_setting(t.root.id, "admins_can_view_notifications", serde_json::json!(false));
    let r = resolve(&engine, at(&t.sub), "view_notifications", &admin).await;
    assert!(!r.account_allows);
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert!(!r.is_grantable());
    assert_eq!(
        engine.enabled_for(at(&t.sub), "view_notifications", &admin).await.unwrap(),
        AppliesTo::NONE
    );
}

// === Allow-listed custom site-admin roles ===

fn allow_listed_site() -> (Site, PermissionEngine) {
    let s = site();
    s.store
        .set_global_setting("allowed_custom_site_admin_roles", "OnTheList,Also on The - List");
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));
    (s, engine)
}

#[tokio::test]
async fn test_allow_listed_role_defaults_enabled_on_other_roots() {
    let (s, engine) = allow_listed_site();
    let role = s
        .store
        .create_custom_role("OnTheList", BaseRoleType::AccountMembership, &s.site_admin);

    let r = resolve(&engine, at(&s.root), "become_user", &role).await;
    assert_eq!(r.enabled, AppliesTo::ALL);

    let spaced = s
        .store
        .create_custom_role("Also on The - List", BaseRoleType::AccountMembership, &s.site_admin);
    let r = resolve(&engine, at(&s.root), "become_user", &spaced).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_allow_list_ignored_at_site_admin() {
    let (s, engine) = allow_listed_site();
    let role = s
        .store
        .create_custom_role("OnTheList", BaseRoleType::AccountMembership, &s.site_admin);

    let r = resolve(&engine, at(&s.site_admin), "manage_account_memberships", &role).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
}

#[tokio::test]
async fn test_unlisted_site_admin_role_is_suppressed() {
    let (s, engine) = allow_listed_site();
    let role = s
        .store
        .create_custom_role("NotOnTheList", BaseRoleType::AccountMembership, &s.site_admin);

    engine
        .manage_override(s.site_admin.id, &role, "become_user", OverrideChange::enabled(true))
        .await
        .unwrap();

    let r = resolve(&engine, at(&s.root), "manage_account_memberships", &role).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
    let r = resolve(&engine, at(&s.root), "become_user", &role).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
}

#[tokio::test]
async fn test_allow_list_does_not_apply_to_other_roots() {
    let (s, engine) = allow_listed_site();
    let role = s
        .store
        .create_custom_role("NotOnTheList", BaseRoleType::AccountMembership, &s.root);

    engine
        .manage_override(s.root.id, &role, "become_user", OverrideChange::enabled(true))
        .await
        .unwrap();
    let r = resolve(&engine, at(&s.root), "become_user", &role).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

#[tokio::test]
async fn test_allow_listed_role_can_be_disabled_at_site_admin() {
    let (s, engine) = allow_listed_site();
    let role = s
        .store
        .create_custom_role("OnTheList", BaseRoleType::AccountMembership, &s.site_admin);

    engine
        .manage_override(s.site_admin.id, &role, "become_user", OverrideChange::enabled(false))
        .await
        .unwrap();
    let r = resolve(&engine, at(&s.root), "become_user", &role).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
}

// === Sharding ===

#[tokio::test]
async fn test_finds_overrides_on_another_shard() {
    let store = Arc::new(MemoryStore::new());
    let account = store.create_root_account("Remote", ShardId(1));
    let admin = store.built_in_role_for(BaseRoleType::AccountAdmin, account.id);
    let engine = engine(&store);

    engine
        .manage_override(account.id, &admin, "become_user", OverrideChange::enabled(false))
        .await
        .unwrap();
    assert_eq!(store.overrides_on(ShardId(1)).len(), 1);

    let r = resolve(&engine, at(&account), "become_user", &admin).await;
    assert_eq!(r.enabled, AppliesTo::NONE);
}

#[tokio::test]
async fn test_site_admin_overrides_reach_other_shards() {
    let store = Arc::new(MemoryStore::new());
    let site_admin = store.create_root_account("Site Admin", ShardId(0));
    let account = store.create_root_account("Remote", ShardId(1));
    let role = store.create_custom_role("custom", BaseRoleType::AccountMembership, &site_admin);
    let engine = engine_with(
        &store,
        &Arc::new(PluginRegistry::new()),
        EngineConfig::default().with_site_admin(site_admin.id),
    );

    engine
        .manage_override(site_admin.id, &role, "become_user", OverrideChange::enabled(true))
        .await
        .unwrap();

    let r = resolve(&engine, at(&account), "become_user", &role).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
    assert_eq!(r.source_account, Some(site_admin.id));
}

#[tokio::test]
async fn test_unavailable_shard_propagates() {
    let store = Arc::new(MemoryStore::new());
    let account = store.create_root_account("Remote", ShardId(2));
    let admin = store.built_in_role_for(BaseRoleType::AccountAdmin, account.id);
    let engine = engine(&store);

    store.set_shard_available(ShardId(2), false);
    let err = engine
        .permission_for(at(&account), "become_user", &admin, ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnavailable { shard: ShardId(2), .. }));

    store.set_shard_available(ShardId(2), true);
    let r = resolve(&engine, at(&account), "become_user", &admin).await;
    assert_eq!(r.enabled, AppliesTo::ALL);
}

// === Role types ===

#[tokio::test]
async fn test_student_view_uses_student_defaults() {
    let t = tree();
    let course = t.store.create_course("Biology 101", &t.sub);
    let fake_student = t
        .store
        .built_in_role_for(BaseRoleType::StudentViewEnrollment, t.root.id);
    let engine = engine(&t.store);

    let ctx = Context::Course(course.id);
    assert_eq!(
        resolve(&engine, ctx, "read_forum", &fake_student).await.enabled,
        AppliesTo::ALL
    );
    assert_eq!(
        resolve(&engine, ctx, "post_to_forum", &fake_student).await.enabled,
        AppliesTo::ALL
    );
    assert_eq!(
        resolve(&engine, ctx, "moderate_forum", &fake_student).await.enabled,
        AppliesTo::NONE
    );
}

#[tokio::test]
async fn test_unknown_permission_is_an_error() {
    let t = tree();
    let teacher = t.store.built_in_role_for(BaseRoleType::TeacherEnrollment, t.root.id);
    let engine = engine(&t.store);

    let err = engine
        .enabled_for(at(&t.root), "fly_to_the_moon", &teacher)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownPermission(ref k) if k == "fly_to_the_moon"));
}

// === manageable_permissions ===

#[tokio::test]
async fn test_manageable_permissions_by_account_level() {
    let s = site();
    let engine = engine_with(&s.store, &Arc::new(PluginRegistry::new()), site_config(&s));

    let at_sub = engine.manageable_permissions(at(&s.sub), None).await.unwrap();
    assert!(!at_sub.contains_key("become_user"));
    assert!(!at_sub.contains_key("view_course_changes"));
    assert!(!at_sub.contains_key("manage_site_settings"));
    assert!(at_sub.contains_key("manage_account_settings"));

    let at_root = engine.manageable_permissions(at(&s.root), None).await.unwrap();
    assert!(at_root.contains_key("become_user"));
    assert!(!at_root.contains_key("manage_site_settings"));

    let at_site_admin = engine
        .manageable_permissions(at(&s.site_admin), None)
        .await
        .unwrap();
    assert!(at_site_admin.contains_key("manage_site_settings"));
}

#[tokio::test]
async fn test_manageable_permissions_filters() {
    let t = tree();
    let plugins = Arc::new(PluginRegistry::new());
    plugins.register("assignment_freezer", false);
    let engine = engine_with(&t.store, &plugins, EngineConfig::default());

    let for_teachers = engine
        .manageable_permissions(at(&t.root), Some(BaseRoleType::TeacherEnrollment))
        .await
        .unwrap();
    assert!(for_teachers.contains_key("moderate_forum"));
    assert!(!for_teachers.contains_key("manage_account_settings"));

    let all = engine.manageable_permissions(at(&t.root), None).await.unwrap();
    assert!(!all.contains_key("view_notifications"));
    assert!(!all.contains_key("manage_frozen_assignments"));

    t.store
        .set_account_setting(t.root.id, "admins_can_view_notifications", serde_json::json!(true));
    {
        let _freezer = plugins.scoped_enabled("assignment_freezer", true);
        let all = engine.manageable_permissions(at(&t.sub), None).await.unwrap();
        assert!(all.contains_key("view_notifications"));
        assert!(all.contains_key("manage_frozen_assignments"));
    }

    let all = engine.manageable_permissions(at(&t.root), None).await.unwrap();
    assert!(!all.contains_key("manage_frozen_assignments"));
}
