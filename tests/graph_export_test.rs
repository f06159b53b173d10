//! Integration tests for the graph export engine
//!
//! Pagination completeness, permission-filtered observation visibility, the
//! explicit-Forbidden contract, and policy-fingerprinted cache tokens.

use mnemograph_core::{
    error::MnemographError,
    export::{ExportBody, ExportQuery, FullExport},
    mutation::{AddObservationsRequest, CreateRelationsRequest, ObservationSpec, RelationSpec},
};
use std::collections::HashSet;

mod common;
use common::{add_observation, create_entity, dev_context, harness, jwt_context};

fn as_full(body: &ExportBody) -> &FullExport {
    match body {
        ExportBody::Full(full) => full,
        ExportBody::EntityScoped(_) => panic!("expected full-mode export"),
    }
}

#[tokio::test]
async fn test_pagination_covers_every_node_exactly_once() {
    let h = harness().await;
    let context = dev_context("tenant-a");

    for i in 0..25 {
        create_entity(&h, &context, &format!("entity-{:02}", i), "service").await;
    }

    for limit in [4u32, 7, 10, 25, 100] {
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let outcome = h
                .export
                .export(
                    &context,
                    &ExportQuery {
                        limit: Some(limit),
                        cursor: cursor.clone(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let full = as_full(&outcome.body);
            seen.extend(full.nodes.iter().map(|n| n.name.clone()));

            assert!(full.nodes.len() as u32 <= limit, "page exceeded limit");
            match &full.next_cursor {
                Some(next) => cursor = Some(next.clone()),
                None => break,
            }
        }

        assert_eq!(seen.len(), 25, "limit {}: wrong total row count", limit);
        let unique: HashSet<&String> = seen.iter().collect();
        assert_eq!(unique.len(), 25, "limit {}: pages overlapped", limit);
    }
}

#[tokio::test]
async fn test_limit_validation() {
    let h = harness().await;
    let context = dev_context("tenant-a");

    for bad in [0u32, 1001, 5000] {
        let err = h
            .export
            .export(
                &context,
                &ExportQuery {
                    limit: Some(bad),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, MnemographError::Validation(_)),
            "limit {} must be rejected",
            bad
        );
    }
}

#[tokio::test]
async fn test_malformed_cursor_rejected() {
    let h = harness().await;
    let context = dev_context("tenant-a");

    let err = h
        .export
        .export(
            &context,
            &ExportQuery {
                cursor: Some("garbage".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MnemographError::Validation(_)));
}

#[tokio::test]
async fn test_sensitive_observation_visibility_by_role() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;
    add_observation(
        &h,
        &writer,
        "ProjectX",
        &["normal text", "[SYSTEM] internal note"],
        None,
    )
    .await;
    add_observation(&h, &writer, "ProjectX", &["ordinary decision"], None).await;

    let query = ExportQuery {
        include_observations: true,
        ..Default::default()
    };

    // Member: sensitive observation is excluded entirely
    let member = jwt_context("tenant-a", "user-m", &["member"]);
    let outcome = h.export.export(&member, &query).await.unwrap();
    let observations = as_full(&outcome.body).observations.as_ref().unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].contents, vec!["ordinary decision"]);

    // Admin: both observations visible
    let admin = jwt_context("tenant-a", "user-a", &["admin"]);
    let outcome = h.export.export(&admin, &query).await.unwrap();
    let observations = as_full(&outcome.body).observations.as_ref().unwrap();
    assert_eq!(observations.len(), 2);
}

#[tokio::test]
async fn test_include_observations_without_permission_is_forbidden() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;

    // Viewer holds graph:view only; the shortfall must be an explicit error,
    // never an empty observations array
    let viewer = jwt_context("tenant-a", "user-v", &["viewer"]);
    let err = h
        .export
        .export(
            &viewer,
            &ExportQuery {
                include_observations: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MnemographError::Forbidden(_)));

    // Without the flag the viewer still gets topology
    let outcome = h
        .export
        .export(&viewer, &ExportQuery::default())
        .await
        .unwrap();
    assert_eq!(as_full(&outcome.body).nodes.len(), 1);
}

#[tokio::test]
async fn test_topology_shape_does_not_vary_with_permissions() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;
    create_entity(&h, &writer, "Alpha", "service").await;
    h.mutations
        .create_relations(
            &writer,
            &CreateRelationsRequest {
                relations: vec![RelationSpec {
                    from: "ProjectX".to_string(),
                    to: "Alpha".to_string(),
                    relation_type: "depends_on".to_string(),
                }],
            },
        )
        .await
        .unwrap();
    add_observation(&h, &writer, "ProjectX", &["[internal] secret"], None).await;

    let viewer = jwt_context("tenant-a", "user-v", &["viewer"]);
    let admin = jwt_context("tenant-a", "user-a", &["admin"]);

    let viewer_out = h.export.export(&viewer, &ExportQuery::default()).await.unwrap();
    let admin_out = h.export.export(&admin, &ExportQuery::default()).await.unwrap();

    let viewer_full = as_full(&viewer_out.body);
    let admin_full = as_full(&admin_out.body);
    assert_eq!(viewer_full.nodes.len(), admin_full.nodes.len());
    assert_eq!(viewer_full.links.len(), admin_full.links.len());
    assert_eq!(viewer_full.links[0].source, "ProjectX");
    assert_eq!(viewer_full.links[0].target, "Alpha");
}

#[tokio::test]
async fn test_cache_token_varies_by_permission_set() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;

    let viewer = jwt_context("tenant-a", "user-v", &["viewer"]);
    let member = jwt_context("tenant-a", "user-m", &["member"]);
    let admin = jwt_context("tenant-a", "user-a", &["admin"]);
    let query = ExportQuery::default();

    let etag_viewer = h.export.export(&viewer, &query).await.unwrap().etag;
    let etag_member = h.export.export(&member, &query).await.unwrap().etag;
    let etag_admin = h.export.export(&admin, &query).await.unwrap().etag;

    // Identical underlying data, different effective permissions, different
    // tokens: cache entries can never be replayed across roles
    assert_ne!(etag_viewer, etag_member);
    assert_ne!(etag_member, etag_admin);
    assert_ne!(etag_viewer, etag_admin);

    // Stable across repeated requests for the same caller
    let etag_member_again = h.export.export(&member, &query).await.unwrap().etag;
    assert_eq!(etag_member, etag_member_again);
}

#[tokio::test]
async fn test_cache_token_changes_when_data_changes() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;

    let admin = jwt_context("tenant-a", "user-a", &["admin"]);
    let query = ExportQuery {
        include_observations: true,
        ..Default::default()
    };

    let before = h.export.export(&admin, &query).await.unwrap().etag;
    add_observation(&h, &writer, "ProjectX", &["new note"], None).await;
    let after = h.export.export(&admin, &query).await.unwrap().etag;
    assert_ne!(before, after);
}

#[tokio::test]
async fn test_entity_scoped_export() {
    let h = harness().await;
    let writer = dev_context("tenant-a");
    create_entity(&h, &writer, "ProjectX", "project").await;
    h.mutations
        .add_observations(
            &writer,
            &AddObservationsRequest {
                observations: vec![
                    ObservationSpec {
                        entity_name: "ProjectX".to_string(),
                        contents: vec!["first".to_string()],
                        message_type: None,
                        sensitive: None,
                    },
                    ObservationSpec {
                        entity_name: "ProjectX".to_string(),
                        contents: vec!["second".to_string()],
                        message_type: None,
                        sensitive: Some(true),
                    },
                ],
            },
        )
        .await
        .unwrap();

    // Member sees only the non-sensitive observation and an
    // observations-only response shape
    let member = jwt_context("tenant-a", "user-m", &["member"]);
    let outcome = h
        .export
        .export(
            &member,
            &ExportQuery {
                entity_name: Some("ProjectX".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    match &outcome.body {
        ExportBody::EntityScoped(scoped) => {
            assert_eq!(scoped.observations.len(), 1);
            assert_eq!(scoped.totals.observations, 1);
            assert_eq!(scoped.observations[0].contents, vec!["first"]);
        }
        ExportBody::Full(_) => panic!("entity-scoped request must not return full shape"),
    }

    // Unknown entity is NotFound
    let err = h
        .export
        .export(
            &member,
            &ExportQuery {
                entity_name: Some("Nope".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MnemographError::NotFound(_)));
}
