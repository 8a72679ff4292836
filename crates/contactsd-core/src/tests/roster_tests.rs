use super::{batch_without_avatars, full_batch};
use crate::avatar::{AvatarStore, StoredAvatar};
use crate::connection::RemoteContact;
use crate::contact::{ContactSnapshot, Readiness};
use crate::event::ContactEvent;
use crate::identity::unique_id;
use crate::roster::{Effect, Roster};
use crate::roster_cache::RosterSnapshot;
use contactsd_api::{Capability, ChangeKind, ChangeSet, PresenceType, RosterChange};
use std::path::PathBuf;
use tempfile::tempdir;

const ACCOUNT: &str = "acct/1";

fn roster(dir: &std::path::Path) -> Roster {
    Roster::new(ACCOUNT, RosterSnapshot::new(), AvatarStore::new(dir), true)
}

fn discover(roster: &mut Roster, handle: u32, protocol_id: &str) -> u64 {
    let effects = roster.discover(RemoteContact::new(handle, protocol_id));
    match effects.as_slice() {
        [Effect::RequestFeatures { request, .. }] => *request,
        other => panic!("unexpected effects {:?}", other),
    }
}

fn stored(token: &str, path: &str) -> StoredAvatar {
    StoredAvatar {
        token: token.to_string(),
        extension: "jpeg".to_string(),
        path: Some(PathBuf::from(path)),
    }
}

#[test]
fn discovery_requests_features_once() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    discover(&mut roster, 7, "bob");
    assert_eq!(
        roster.contact("bob").expect("bob").readiness(),
        Readiness::AcquiringFeatures
    );
    assert!(roster.discover(RemoteContact::new(7, "bob")).is_empty());
    assert!(roster.discover(RemoteContact::new(8, "")).is_empty());
    assert_eq!(roster.len(), 1);
}

#[test]
fn completion_requests_avatar_before_ready() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");

    let effects = roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tok1"))]);
    assert_eq!(effects.len(), 2);
    assert_eq!(
        effects[0],
        Effect::RequestAvatar {
            protocol_id: "bob".to_string(),
            handle: 7,
            token: Some("tok1".to_string()),
        }
    );
    match &effects[1] {
        Effect::Emit(ContactEvent::Ready(contact)) => {
            assert!(contact.is_ready());
            assert_eq!(contact.alias(), "Bob");
            assert_eq!(contact.unique_id(), unique_id(ACCOUNT, "bob"));
        }
        other => panic!("unexpected effect {:?}", other),
    }
}

#[test]
fn ready_fires_once() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    let batch = vec![full_batch(7, "Bob", None)];
    assert!(!roster.features_completed("bob", request, batch.clone()).is_empty());
    assert!(roster.features_completed("bob", request, batch).is_empty());
}

#[test]
fn contact_without_avatar_support_is_ready_without_retrieval() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    let effects = roster.features_completed("bob", request, vec![batch_without_avatars(7, "Bob")]);
    assert_eq!(effects.len(), 1);
    assert!(matches!(effects[0], Effect::Emit(ContactEvent::Ready(_))));
    assert!(roster.avatar_updated(7, "tok9").is_empty());
}

#[test]
fn unresolved_batch_leaves_contact_new() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    let effects = roster.features_completed("bob", request, Vec::new());
    assert_eq!(
        effects,
        vec![Effect::RetryFeatures {
            protocol_id: "bob".to_string(),
            attempt: 1,
        }]
    );
    let contact = roster.contact("bob").expect("bob");
    assert_eq!(contact.readiness(), Readiness::New);
    assert_eq!(contact.failed_attempts(), 1);
}

#[test]
fn live_event_for_new_contact_requests_features_again() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_failed("bob", request, "timeout");

    let effects = roster.presence_changed(7, PresenceType::Away, "away", "");
    let retry = match effects.as_slice() {
        [Effect::RequestFeatures { request, handle: 7, .. }] => *request,
        other => panic!("unexpected effects {:?}", other),
    };
    assert_ne!(retry, request);

    // The stale completion of the first request is ignored.
    assert!(roster
        .features_completed("bob", request, vec![full_batch(7, "Bob", None)])
        .is_empty());
    assert!(!roster
        .features_completed("bob", retry, vec![full_batch(7, "Bob", None)])
        .is_empty());
}

#[test]
fn events_while_acquiring_are_ignored() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    discover(&mut roster, 7, "bob");
    assert!(roster.alias_changed(7, "Robert").is_empty());
    assert!(roster
        .presence_changed(7, PresenceType::Busy, "busy", "")
        .is_empty());
}

#[test]
fn live_changes_update_ready_contact() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", None)]);
    let id = unique_id(ACCOUNT, "bob");

    let effects = roster.presence_changed(7, PresenceType::Busy, "dnd", "meeting");
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Changed {
            unique_id: id,
            kind: ChangeKind::Presence,
        })]
    );
    let caps = [Capability::AudioCall].into_iter().collect();
    let effects = roster.capabilities_changed(7, caps);
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Changed {
            unique_id: id,
            kind: ChangeKind::Capabilities,
        })]
    );
    roster.alias_changed(7, "Robert");

    let contact = roster.contact("bob").expect("bob");
    assert_eq!(contact.presence_type(), PresenceType::Busy);
    assert_eq!(contact.presence_message(), "meeting");
    assert!(contact.capabilities().contains(&Capability::AudioCall));
    assert_eq!(contact.alias(), "Robert");
    assert!(roster.alias_changed(99, "nobody").is_empty());
}

#[test]
fn avatar_flow_filters_by_handle_and_token() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let bob = discover(&mut roster, 7, "bob");
    let carol = discover(&mut roster, 8, "carol");
    roster.features_completed("bob", bob, vec![full_batch(7, "Bob", Some("tok1"))]);
    roster.features_completed("carol", carol, vec![full_batch(8, "Carol", None)]);

    // Another contact's avatar and a superseded token are both dropped.
    assert!(roster.avatar_retrieved(9, "tok1", b"data", "image/jpeg").is_empty());
    assert!(roster.avatar_retrieved(7, "tok0", b"data", "image/jpeg").is_empty());

    let effects = roster.avatar_retrieved(7, "tok1", b"data", "image/jpeg");
    assert_eq!(
        effects,
        vec![Effect::StoreAvatar {
            protocol_id: "bob".to_string(),
            token: "tok1".to_string(),
            mime: "image/jpeg".to_string(),
            data: b"data".to_vec(),
        }]
    );
    // Duplicate delivery while storing.
    assert!(roster.avatar_retrieved(7, "tok1", b"data", "image/jpeg").is_empty());

    let effects = roster.avatar_stored("bob", stored("tok1", "/tmp/telepathy_cachetok1.jpeg"));
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Changed {
            unique_id: unique_id(ACCOUNT, "bob"),
            kind: ChangeKind::Avatar,
        })]
    );
    let contact = roster.contact("bob").expect("bob");
    assert_eq!(contact.avatar_token(), Some("tok1"));
    assert_eq!(contact.avatar_mime_extension(), Some("jpeg"));
}

#[test]
fn same_token_twice_is_requested_once() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", None)]);

    assert_eq!(roster.avatar_updated(7, "tok2").len(), 1);
    assert!(roster.avatar_updated(7, "tok2").is_empty());
    roster.avatar_retrieved(7, "tok2", b"x", "image/png");
    roster.avatar_stored("bob", stored("tok2", "/tmp/a.png"));
    assert!(roster.avatar_updated(7, "tok2").is_empty());
}

#[test]
fn newer_token_supersedes_store_in_flight() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tok1"))]);
    roster.avatar_retrieved(7, "tok1", b"one", "image/jpeg");
    assert_eq!(roster.avatar_updated(7, "tok2").len(), 1);

    assert!(roster
        .avatar_stored("bob", stored("tok1", "/tmp/one.jpeg"))
        .is_empty());
    assert_eq!(roster.avatar_retrieved(7, "tok2", b"two", "image/jpeg").len(), 1);
    assert_eq!(
        roster
            .avatar_stored("bob", stored("tok2", "/tmp/two.jpeg"))
            .len(),
        1
    );
    assert_eq!(roster.contact("bob").expect("bob").avatar_token(), Some("tok2"));
}

#[test]
fn late_retrieval_of_replaced_token_is_discarded() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tokA"))]);
    assert_eq!(roster.avatar_updated(7, "tokB").len(), 1);
    assert_eq!(roster.avatar_retrieved(7, "tokB", b"b", "image/jpeg").len(), 1);
    assert_eq!(
        roster.avatar_stored("bob", stored("tokB", "/tmp/b.jpeg")).len(),
        1
    );

    assert!(roster.avatar_retrieved(7, "tokA", b"a", "image/jpeg").is_empty());
    assert!(roster
        .avatar_stored("bob", stored("tokA", "/tmp/a.jpeg"))
        .is_empty());
    assert_eq!(roster.contact("bob").expect("bob").avatar_token(), Some("tokB"));
}

#[test]
fn current_token_without_file_is_stored_again() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tok1"))]);
    roster.avatar_retrieved(7, "tok1", b"junk", "image/jpeg");
    roster.avatar_stored(
        "bob",
        StoredAvatar {
            token: "tok1".to_string(),
            extension: "jpeg".to_string(),
            path: None,
        },
    );

    assert_eq!(roster.avatar_retrieved(7, "tok1", b"good", "image/jpeg").len(), 1);
    assert!(roster.avatar_retrieved(7, "tok9", b"other", "image/jpeg").is_empty());
}

#[test]
fn empty_token_clears_avatar() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tok1"))]);
    roster.avatar_retrieved(7, "tok1", b"one", "image/jpeg");
    roster.avatar_stored("bob", stored("tok1", "/tmp/one.jpeg"));

    let effects = roster.avatar_updated(7, "");
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Changed {
            unique_id: unique_id(ACCOUNT, "bob"),
            kind: ChangeKind::Avatar,
        })]
    );
    let contact = roster.contact("bob").expect("bob");
    assert!(contact.avatar_token().is_none());
    assert!(contact.avatar_file_path().is_none());
}

#[test]
fn removal_drops_pending_completions() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    let effects = roster.remove("bob");
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Removed {
            unique_id: unique_id(ACCOUNT, "bob"),
        })]
    );
    assert!(roster
        .features_completed("bob", request, vec![full_batch(7, "Bob", None)])
        .is_empty());
    assert!(roster.remove("bob").is_empty());
    assert!(roster.contact_by_handle(7).is_none());
}

#[test]
fn connection_loss_marks_pending_contacts_unavailable() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let bob = discover(&mut roster, 7, "bob");
    discover(&mut roster, 8, "carol");
    roster.features_completed("bob", bob, vec![full_batch(7, "Bob", None)]);

    roster.connection_lost();
    assert_eq!(roster.contact("bob").expect("bob").readiness(), Readiness::Ready);
    assert_eq!(
        roster.contact("carol").expect("carol").readiness(),
        Readiness::Unavailable
    );
    assert_eq!(roster.retry_features("carol").len(), 1);
}

#[test]
fn cached_snapshot_seeds_contact_and_skips_known_avatar() {
    let dir = tempdir().expect("tempdir");
    let avatars = AvatarStore::new(dir.path());
    std::fs::write(avatars.file_path("tok1", "jpeg"), b"cached").expect("write");
    let mut cached = RosterSnapshot::new();
    cached.insert(
        "bob".to_string(),
        ContactSnapshot {
            alias: "Cached Bob".to_string(),
            presence_type: PresenceType::Away,
            avatar_token: Some("tok1".to_string()),
            avatar_mime_extension: Some("jpeg".to_string()),
            ..ContactSnapshot::default()
        },
    );
    let mut roster = Roster::new(ACCOUNT, cached, avatars.clone(), true);

    let request = discover(&mut roster, 7, "bob");
    let seeded = roster.contact("bob").expect("bob");
    assert_eq!(seeded.alias(), "Cached Bob");
    assert_eq!(
        seeded.avatar_file_path(),
        Some(avatars.file_path("tok1", "jpeg").as_path())
    );

    let effects = roster.features_completed("bob", request, vec![full_batch(7, "Bob", Some("tok1"))]);
    assert_eq!(effects.len(), 1);
    assert!(matches!(effects[0], Effect::Emit(ContactEvent::Ready(_))));
}

#[test]
fn roster_changes_against_cache() {
    let dir = tempdir().expect("tempdir");
    let mut cached = RosterSnapshot::new();
    cached.insert(
        "bob".to_string(),
        ContactSnapshot {
            alias: "Bob".to_string(),
            presence_type: PresenceType::Available,
            presence_message: "hi".to_string(),
            capabilities: [Capability::TextChat].into_iter().collect(),
            ..ContactSnapshot::default()
        },
    );
    cached.insert("dave".to_string(), ContactSnapshot::default());
    let mut roster = Roster::new(ACCOUNT, cached, AvatarStore::new(dir.path()), true);

    let bob = discover(&mut roster, 7, "bob");
    let carol = discover(&mut roster, 8, "carol");
    roster.features_completed("bob", bob, vec![full_batch(7, "Bobby", None)]);
    roster.features_completed("carol", carol, vec![full_batch(8, "Carol", None)]);

    let changes = roster.roster_changes();
    assert_eq!(
        changes.get("bob"),
        Some(&RosterChange::Changed(ChangeSet::from(ChangeKind::Alias)))
    );
    assert_eq!(changes.get("carol"), Some(&RosterChange::Added));
    assert_eq!(changes.get("dave"), Some(&RosterChange::Deleted));
}

#[test]
fn clear_removes_everything() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    discover(&mut roster, 7, "bob");
    discover(&mut roster, 8, "carol");
    let effects = roster.clear();
    assert_eq!(effects.len(), 2);
    assert!(effects
        .iter()
        .all(|effect| matches!(effect, Effect::Emit(ContactEvent::Removed { .. }))));
    assert!(roster.is_empty());
    assert!(roster.snapshot().is_empty());
    assert!(roster.cached().is_empty());
}

#[test]
fn avatar_update_for_unresolved_contact_requests_features() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let request = discover(&mut roster, 7, "bob");
    roster.features_failed("bob", request, "timeout");

    let effects = roster.avatar_updated(7, "tok1");
    assert!(matches!(
        effects.as_slice(),
        [Effect::RequestFeatures { handle: 7, .. }]
    ));
    assert_eq!(
        roster.contact("bob").expect("bob").readiness(),
        Readiness::AcquiringFeatures
    );
}

#[test]
fn avoided_contacts_are_never_discovered() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    assert!(roster
        .set_contacts_to_avoid(["carol".to_string()].into_iter().collect())
        .is_empty());
    assert!(roster.discover(RemoteContact::new(8, "carol")).is_empty());
    discover(&mut roster, 7, "bob");

    let effects = roster.set_contacts_to_avoid(["bob".to_string()].into_iter().collect());
    assert_eq!(
        effects,
        vec![Effect::Emit(ContactEvent::Removed {
            unique_id: unique_id(ACCOUNT, "bob"),
        })]
    );
    assert!(roster.is_empty());
    assert!(roster.discover(RemoteContact::new(7, "bob")).is_empty());
    discover(&mut roster, 8, "carol");
    assert_eq!(roster.len(), 1);
}

#[test]
fn reconcile_repairs_missed_notifications() {
    let dir = tempdir().expect("tempdir");
    let mut roster = roster(dir.path());
    let bob = discover(&mut roster, 7, "bob");
    let carol = discover(&mut roster, 8, "carol");
    discover(&mut roster, 9, "dave");
    roster.features_completed("bob", bob, vec![full_batch(7, "Bob", Some("tok1"))]);
    roster.features_failed("carol", carol, "timeout");

    let effects = roster.reconcile(vec![
        RemoteContact::new(7, "bob"),
        RemoteContact::new(8, "carol"),
        RemoteContact::new(10, "erin"),
    ]);
    assert_eq!(effects.len(), 4);
    assert_eq!(
        effects[0],
        Effect::Emit(ContactEvent::Removed {
            unique_id: unique_id(ACCOUNT, "dave"),
        })
    );
    assert_eq!(
        effects[1],
        Effect::RequestAvatar {
            protocol_id: "bob".to_string(),
            handle: 7,
            token: Some("tok1".to_string()),
        }
    );
    assert!(matches!(
        &effects[2],
        Effect::RequestFeatures { protocol_id, handle: 8, .. } if protocol_id == "carol"
    ));
    assert!(matches!(
        &effects[3],
        Effect::RequestFeatures { protocol_id, handle: 10, .. } if protocol_id == "erin"
    ));
    assert!(roster.contact("dave").is_none());
}
