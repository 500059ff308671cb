use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use draw_core::{
    normalize_name, Assignment, DrawError, Group, InvariantViolation, JoinError, Participant,
    WishlistError,
};
use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{GroupStore, StoreError, Versioned};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("group not found")]
    GroupNotFound,
    #[error("participant not found")]
    ParticipantNotFound,
    #[error("name required")]
    InvalidName,
    #[error("a group with that name already exists")]
    GroupNameTaken,
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error("group changed concurrently, try again")]
    CommitConflict,
    #[error("stored group is invalid: {0}")]
    Corrupt(InvariantViolation),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for ExchangeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ExchangeError::GroupNotFound,
            StoreError::DuplicateName(_) => ExchangeError::GroupNameTaken,
            StoreError::Conflict { .. } => ExchangeError::CommitConflict,
            StoreError::Invalid(violation) => ExchangeError::Corrupt(violation),
            StoreError::Unavailable(reason) => ExchangeError::StoreUnavailable(reason),
        }
    }
}

impl From<WishlistError> for ExchangeError {
    fn from(err: WishlistError) -> Self {
        match err {
            WishlistError::ParticipantNotFound(_) => ExchangeError::ParticipantNotFound,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct Exchange {
    store: Arc<dyn GroupStore>,
    max_commit_retries: u32,
}

impl Exchange {
    pub fn new(store: Arc<dyn GroupStore>, max_commit_retries: u32) -> Self {
        Self {
            store,
            max_commit_retries,
        }
    }

    pub async fn create_group(&self, name: &str) -> Result<Versioned<Group>, ExchangeError> {
        let name = normalize_name(name).ok_or(ExchangeError::InvalidName)?;
        let group = Group::new(Uuid::new_v4().to_string(), name, now_millis());
        let record = self.store.insert(group).await?;
        info!(group_id = %record.doc.id, name = %record.doc.name, "group created");
        Ok(record)
    }

    pub async fn group(&self, group_id: &str) -> Result<Versioned<Group>, ExchangeError> {
        self.store
            .get(group_id)
            .await?
            .ok_or(ExchangeError::GroupNotFound)
    }

    pub async fn groups(&self) -> Result<Vec<Versioned<Group>>, ExchangeError> {
        Ok(self.store.list().await?)
    }

    pub async fn subscribe(
        &self,
        group_id: &str,
    ) -> Result<broadcast::Receiver<Versioned<Group>>, ExchangeError> {
        Ok(self.store.subscribe(group_id).await?)
    }

    pub async fn join_group(
        &self,
        group_name: &str,
        participant_name: &str,
    ) -> Result<(Versioned<Group>, Participant), ExchangeError> {
        let group_id = self
            .store
            .find_by_name(group_name)
            .await?
            .ok_or(ExchangeError::GroupNotFound)?
            .doc
            .id;

        // Same id on every retry.
        let participant_id = Uuid::new_v4().to_string();
        let joined_at = now_millis();
        let (record, participant) = self
            .update_with_retry(&group_id, |group| {
                Ok(group.add_participant(participant_id.clone(), participant_name, joined_at)?)
            })
            .await?;

        info!(
            group_id = %group_id,
            participant_id = %participant.id,
            participants = record.doc.participants.len(),
            "participant joined"
        );
        Ok((record, participant))
    }

    pub async fn update_wishlist(
        &self,
        group_id: &str,
        participant_id: &str,
        wishlist: &str,
    ) -> Result<Participant, ExchangeError> {
        let (_, participant) = self
            .update_with_retry(group_id, |group| {
                Ok(group.update_wishlist(participant_id, wishlist)?.clone())
            })
            .await?;
        debug!(group_id, participant_id, "wishlist updated");
        Ok(participant)
    }

    pub async fn run_draw<R: Rng + Send + ?Sized>(
        &self,
        group_id: &str,
        rng: &mut R,
    ) -> Result<(Versioned<Group>, Assignment), ExchangeError> {
        let now = now_millis();
        let result = self
            .update_with_retry(group_id, |group| Ok(group.draw(&mut *rng, now)?))
            .await;

        match &result {
            Ok((record, assignment)) => info!(
                group_id,
                version = record.version,
                participants = assignment.pairs().len(),
                "draw committed"
            ),
            Err(err) => warn!(group_id, error = %err, "draw refused"),
        }
        result
    }

    async fn update_with_retry<T, F>(
        &self,
        group_id: &str,
        mut mutate: F,
    ) -> Result<(Versioned<Group>, T), ExchangeError>
    where
        T: Send,
        F: FnMut(&mut Group) -> Result<T, ExchangeError> + Send,
    {
        let mut attempt = 0;
        loop {
            let current = self.group(group_id).await?;
            let mut next = current.doc.clone();
            let output = mutate(&mut next)?;

            match self
                .store
                .compare_and_swap(group_id, current.version, next)
                .await
            {
                Ok(committed) => return Ok((committed, output)),
                Err(StoreError::Conflict { expected, actual })
                    if attempt < self.max_commit_retries =>
                {
                    attempt += 1;
                    debug!(group_id, expected, actual, attempt, "commit conflict, retrying");
                }
                Err(StoreError::Conflict { .. }) => {
                    warn!(group_id, attempts = attempt + 1, "giving up after repeated conflicts");
                    return Err(ExchangeError::CommitConflict);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn exchange() -> (Exchange, InMemoryStore) {
        let store = InMemoryStore::new();
        (Exchange::new(Arc::new(store.clone()), 5), store)
    }

    async fn seeded_group(exchange: &Exchange, names: &[&str]) -> String {
        let record = exchange.create_group("North Pole").await.unwrap();
        for name in names {
            exchange.join_group("north pole", name).await.unwrap();
        }
        record.doc.id
    }

    fn assert_drawn(group: &Group) {
        group.check_invariants().unwrap();
        assert!(group.draw_completed);
        assert!(group.participants.iter().all(|p| p.assigned_to.is_some()));
    }

    // Committed by another writer right before our first conditional write.
    enum Interloper {
        Join(String),
        Draw(u64),
    }

    struct RacingStore {
        inner: InMemoryStore,
        interloper: Mutex<Option<Interloper>>,
        conflicts: AtomicUsize,
    }

    fn racing(inner: &InMemoryStore, interloper: Interloper) -> Arc<RacingStore> {
        Arc::new(RacingStore {
            inner: inner.clone(),
            interloper: Mutex::new(Some(interloper)),
            conflicts: AtomicUsize::new(0),
        })
    }

    #[async_trait]
    impl GroupStore for RacingStore {
        async fn insert(&self, group: Group) -> Result<Versioned<Group>, StoreError> {
            self.inner.insert(group).await
        }

        async fn get(&self, id: &str) -> Result<Option<Versioned<Group>>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<Versioned<Group>>, StoreError> {
            self.inner.find_by_name(name).await
        }

        async fn list(&self) -> Result<Vec<Versioned<Group>>, StoreError> {
            self.inner.list().await
        }

        async fn compare_and_swap(
            &self,
            id: &str,
            expected_version: u64,
            group: Group,
        ) -> Result<Versioned<Group>, StoreError> {
            if let Some(interloper) = self.interloper.lock().await.take() {
                let current = self.inner.get(id).await?.ok_or(StoreError::NotFound(id.into()))?;
                let mut raced = current.doc.clone();
                match interloper {
                    Interloper::Join(name) => raced
                        .add_participant(format!("late-{name}"), &name, 0)
                        .map(|_| ())
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                    Interloper::Draw(seed) => raced
                        .draw(&mut ChaCha8Rng::seed_from_u64(seed), 0)
                        .map(|_| ())
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                }
                self.inner
                    .compare_and_swap(id, current.version, raced)
                    .await?;
            }
            let result = self.inner.compare_and_swap(id, expected_version, group).await;
            if matches!(result, Err(StoreError::Conflict { .. })) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            result
        }

        async fn subscribe(
            &self,
            id: &str,
        ) -> Result<broadcast::Receiver<Versioned<Group>>, StoreError> {
            self.inner.subscribe(id).await
        }
    }

    // Conditional writes always lose, or always fail outright.
    struct HostileStore {
        inner: InMemoryStore,
        unavailable: bool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl GroupStore for HostileStore {
        async fn insert(&self, group: Group) -> Result<Versioned<Group>, StoreError> {
            self.inner.insert(group).await
        }

        async fn get(&self, id: &str) -> Result<Option<Versioned<Group>>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<Versioned<Group>>, StoreError> {
            self.inner.find_by_name(name).await
        }

        async fn list(&self) -> Result<Vec<Versioned<Group>>, StoreError> {
            self.inner.list().await
        }

        async fn compare_and_swap(
            &self,
            _id: &str,
            expected_version: u64,
            _group: Group,
        ) -> Result<Versioned<Group>, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.unavailable {
                Err(StoreError::Unavailable("connection reset".into()))
            } else {
                Err(StoreError::Conflict {
                    expected: expected_version,
                    actual: expected_version + 1,
                })
            }
        }

        async fn subscribe(
            &self,
            id: &str,
        ) -> Result<broadcast::Receiver<Versioned<Group>>, StoreError> {
            self.inner.subscribe(id).await
        }
    }

    async fn hostile(unavailable: bool) -> (Exchange, Arc<HostileStore>, String) {
        let inner = InMemoryStore::new();
        let mut group = Group::new("g1", "North Pole", 1);
        group.add_participant("a", "A", 1).unwrap();
        group.add_participant("b", "B", 1).unwrap();
        inner.insert(group).await.unwrap();

        let store = Arc::new(HostileStore {
            inner,
            unavailable,
            attempts: AtomicUsize::new(0),
        });
        (Exchange::new(store.clone(), 3), store, "g1".to_string())
    }

    #[tokio::test]
    async fn create_group_validates_and_dedupes_names() {
        let (exchange, _) = exchange();
        assert_eq!(
            exchange.create_group("   ").await.unwrap_err(),
            ExchangeError::InvalidName
        );
        exchange.create_group(" North Pole ").await.unwrap();
        assert_eq!(
            exchange.create_group("NORTH POLE").await.unwrap_err(),
            ExchangeError::GroupNameTaken
        );
    }

    #[tokio::test]
    async fn join_by_name_rejects_duplicates_before_any_draw() {
        let (exchange, _) = exchange();
        let group_id = seeded_group(&exchange, &["Alice"]).await;

        let err = exchange.join_group("North Pole", "ALICE").await.unwrap_err();
        assert_eq!(err, ExchangeError::Join(JoinError::DuplicateName("ALICE".into())));
        assert_eq!(
            exchange.join_group("South Pole", "Bob").await.unwrap_err(),
            ExchangeError::GroupNotFound
        );

        let record = exchange.group(&group_id).await.unwrap();
        assert_eq!(record.doc.participants.len(), 1);
        assert!(!record.doc.draw_completed);
    }

    #[tokio::test]
    async fn draw_commits_a_derangement_once() {
        let (exchange, _) = exchange();
        let group_id = seeded_group(&exchange, &["Alice", "Bob", "Carol", "Dave"]).await;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let (record, assignment) = exchange.run_draw(&group_id, &mut rng).await.unwrap();
        assert_drawn(&record.doc);
        for pair in assignment.pairs() {
            assert_eq!(
                record.doc.participant(&pair.participant_id).unwrap().assigned_to.as_deref(),
                Some(pair.assigned_to.as_str())
            );
        }

        let err = exchange.run_draw(&group_id, &mut rng).await.unwrap_err();
        assert_eq!(err, ExchangeError::Draw(DrawError::AlreadyCompleted));
        assert_eq!(exchange.group(&group_id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn draw_needs_two_participants() {
        let (exchange, _) = exchange();
        let group_id = seeded_group(&exchange, &["Alice"]).await;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let err = exchange.run_draw(&group_id, &mut rng).await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::Draw(DrawError::InsufficientParticipants { count: 1 })
        );
        let record = exchange.group(&group_id).await.unwrap();
        assert_eq!(record.version, 2);
        assert!(!record.doc.draw_completed);
    }

    #[tokio::test]
    async fn concurrent_draws_commit_exactly_once() {
        let inner = InMemoryStore::new();
        let mut group = Group::new("g1", "North Pole", 1);
        for (id, name) in [("a", "Alice"), ("b", "Bob"), ("c", "Carol")] {
            group.add_participant(id, name, 1).unwrap();
        }
        inner.insert(group.clone()).await.unwrap();

        let store = racing(&inner, Interloper::Draw(10));
        let exchange = Exchange::new(store.clone(), 5);
        let mut rng = ChaCha8Rng::seed_from_u64(20);

        let err = exchange.run_draw("g1", &mut rng).await.unwrap_err();
        assert_eq!(err, ExchangeError::Draw(DrawError::AlreadyCompleted));
        assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);

        let mut expected = group;
        expected.draw(&mut ChaCha8Rng::seed_from_u64(10), 0).unwrap();

        let record = inner.get("g1").await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.doc, expected);
        assert_drawn(&record.doc);
    }

    #[tokio::test]
    async fn draw_retries_against_the_fresh_roster() {
        let inner = InMemoryStore::new();
        let mut group = Group::new("g1", "North Pole", 1);
        group.add_participant("a", "Alice", 1).unwrap();
        group.add_participant("b", "Bob", 1).unwrap();
        inner.insert(group).await.unwrap();

        let store = racing(&inner, Interloper::Join("Eve".into()));
        let exchange = Exchange::new(store.clone(), 5);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (committed, assignment) = exchange.run_draw("g1", &mut rng).await.unwrap();

        assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(committed.version, 3);
        assert_eq!(committed.doc.participants.len(), 3);
        assert_eq!(assignment.pairs().len(), 3);
        assert!(assignment.recipient_of("late-Eve").is_some());
        assert_drawn(&committed.doc);
    }

    #[tokio::test]
    async fn join_retries_past_a_concurrent_join() {
        let inner = InMemoryStore::new();
        inner.insert(Group::new("g1", "North Pole", 1)).await.unwrap();
        let exchange = Exchange::new(racing(&inner, Interloper::Join("Eve".into())), 5);

        let (record, alice) = exchange.join_group("north pole", "Alice").await.unwrap();
        let names: Vec<&str> = record.doc.participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Eve", "Alice"]);
        assert_eq!(record.doc.participants[1].id, alice.id);
        assert_eq!(record.version, 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_budget() {
        let (exchange, store, group_id) = hostile(false).await;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let err = exchange.run_draw(&group_id, &mut rng).await.unwrap_err();
        assert_eq!(err, ExchangeError::CommitConflict);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 4);

        let record = exchange.group(&group_id).await.unwrap();
        assert!(!record.doc.draw_completed);
        assert!(record.doc.participants.iter().all(|p| p.assigned_to.is_none()));
    }

    #[tokio::test]
    async fn unavailable_store_is_reported_not_retried() {
        let (exchange, store, group_id) = hostile(true).await;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let err = exchange.run_draw(&group_id, &mut rng).await.unwrap_err();
        assert!(matches!(err, ExchangeError::StoreUnavailable(_)));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_joins_all_land() {
        let store = InMemoryStore::new();
        let exchange = Exchange::new(Arc::new(store), 32);
        let group_id = exchange.create_group("North Pole").await.unwrap().doc.id;

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let exchange = exchange.clone();
                tokio::spawn(async move { exchange.join_group("North Pole", &format!("elf {i}")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = exchange.group(&group_id).await.unwrap();
        let names: HashSet<&str> = record.doc.participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.len(), 10);
        assert_eq!(record.version, 11);
    }

    #[tokio::test]
    async fn wishlist_edits_survive_and_follow_the_draw() {
        let (exchange, _) = exchange();
        let group_id = seeded_group(&exchange, &["Alice", "Bob"]).await;
        let record = exchange.group(&group_id).await.unwrap();
        let alice = record.doc.participants[0].id.clone();
        let bob = record.doc.participants[1].id.clone();

        exchange.update_wishlist(&group_id, &bob, " a scarf ").await.unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        exchange.run_draw(&group_id, &mut rng).await.unwrap();

        let updated = exchange
            .update_wishlist(&group_id, &bob, "a scarf, and gloves")
            .await
            .unwrap();
        assert_eq!(updated.wishlist, "a scarf, and gloves");

        let record = exchange.group(&group_id).await.unwrap();
        assert_drawn(&record.doc);
        let recipient = record.doc.recipient_of(&alice).unwrap();
        assert_eq!(recipient.id, bob);
        assert_eq!(recipient.wishlist, "a scarf, and gloves");

        assert_eq!(
            exchange.update_wishlist(&group_id, "nobody", "x").await.unwrap_err(),
            ExchangeError::ParticipantNotFound
        );
    }
}
