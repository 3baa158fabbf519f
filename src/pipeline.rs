use crate::amo::client::CustomField;
use crate::amo::{CrmApi, CrmError, Lead};
use crate::calendar::{CalendarError, DayClassifier, DeadlineCalculator, resolve_category};
use crate::imagegen::ImageRenderer;
use crate::models::{LeadStatus, NewOrder, OrderProjection, manager_profile};
use crate::registry::{PermitRegistry, RegistryEntry};
use crate::store::{OrderStore, StoreError};
use crate::webhook::StatusChange;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Permit fields that only enrichment populates. Once stored they are
/// carried forward across CRM re-fetches that do not supply them.
const CARRIED_PERMIT_KEYS: &[&str] = &[
    "permit_series",
    "permit_number",
    "valid_from",
    "valid_until",
    "registry_status",
    "ready_at",
];

const IMAGE_URL_KEY: &str = "image_url";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Webhook reconciliation pipeline: re-fetches the authoritative lead,
/// merges it with the stored projection, runs transition-gated enrichment
/// and upserts the result. Statelessly re-entrant; all durable state lives
/// in the store.
pub struct Pipeline<S, C, D, R, I>
where
    S: OrderStore,
    C: CrmApi,
    D: DayClassifier,
    R: PermitRegistry,
    I: ImageRenderer,
{
    store: Arc<S>,
    crm: Arc<C>,
    calendar: DeadlineCalculator<D>,
    registry: Option<R>,
    imagegen: Option<I>,
    track_base: String,
}

impl<S, C, D, R, I> Pipeline<S, C, D, R, I>
where
    S: OrderStore,
    C: CrmApi,
    D: DayClassifier,
    R: PermitRegistry,
    I: ImageRenderer,
{
    pub fn new(
        store: Arc<S>,
        crm: Arc<C>,
        calendar: DeadlineCalculator<D>,
        registry: Option<R>,
        imagegen: Option<I>,
        track_base: impl Into<String>,
    ) -> Self {
        Self {
            store,
            crm,
            calendar,
            registry,
            imagegen,
            track_base: track_base.into(),
        }
    }

    /// Reconciles one lead. Enrichment failures are logged and skipped for
    /// this cycle; only CRM/storage failures on the critical path
    /// propagate to the caller (the job worker, which logs them).
    pub async fn process_lead(
        &self,
        lead_id: i64,
        status_change: Option<StatusChange>,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let Some(lead) = self.crm.lead(lead_id).await? else {
            warn!(target = "permit.pipeline", lead_id, "lead not found in CRM, skipping");
            return Ok(());
        };

        let status = LeadStatus::from_id(lead.status_id);
        let (mut car_info, mut permit_info) =
            map_custom_fields(lead.custom_fields_values.as_deref().unwrap_or_default());

        let existing = self.store.get_by_lead_id(lead.id).await?;
        let had_slug = existing
            .as_ref()
            .is_some_and(|order| order.hash_slug.is_some());
        carry_forward(&mut car_info, &mut permit_info, existing.as_ref());

        if status == LeadStatus::PermitReleased {
            self.enrich_from_registry(&lead, status_change, &mut permit_info)
                .await;
        }

        if status == LeadStatus::DocumentsSubmitted {
            self.attach_ready_at(&lead, &mut permit_info).await;
        }

        let manager_contact = self.resolve_manager(&lead).await;

        let saved = self
            .store
            .upsert(NewOrder {
                amo_lead_id: lead.id,
                status_id: lead.status_id,
                status_step: None,
                status_label: lead.name.clone(),
                car_info: Value::Object(car_info.clone()),
                permit_info: Value::Object(permit_info.clone()),
                manager_contact: manager_contact.clone(),
            })
            .await?;
        info!(
            target = "permit.pipeline",
            lead_id = lead.id,
            status_id = lead.status_id,
            status_step = saved.status_step,
            slug = saved.hash_slug.as_deref().unwrap_or("-"),
            "order upserted"
        );

        // The image follow-up is a strict superset write of the committed
        // upsert; losing it only delays the image to a later delivery.
        if let Some(image_url) = self.maybe_generate_image(&lead, &car_info).await {
            car_info.insert(IMAGE_URL_KEY.into(), Value::String(image_url));
            self.store
                .upsert(NewOrder {
                    amo_lead_id: lead.id,
                    status_id: lead.status_id,
                    status_step: None,
                    status_label: lead.name.clone(),
                    car_info: Value::Object(car_info),
                    permit_info: Value::Object(permit_info),
                    manager_contact,
                })
                .await?;
        }

        if status.posts_tracking_link()
            && !had_slug
            && let Some(slug) = saved.hash_slug.as_deref()
        {
            self.post_tracking_link(lead.id, slug).await;
        }

        crate::metrics::lead_processed(lead.id, started.elapsed().as_millis());
        Ok(())
    }

    /// Registry lookup fires once per lead: only on a genuine transition
    /// into PermitReleased and only while no registry data is stored yet,
    /// so a failed lookup is retried by the next delivery for this lead.
    async fn enrich_from_registry(
        &self,
        lead: &Lead,
        status_change: Option<StatusChange>,
        permit_info: &mut Map<String, Value>,
    ) {
        let Some(registry) = &self.registry else {
            return;
        };
        let genuine_transition = status_change.is_some_and(|change| {
            change
                .old_status_id
                .is_some_and(|old| old != lead.status_id)
        });
        if !genuine_transition || permit_info.contains_key("permit_number") {
            return;
        }
        let Some(reg_number) = lead.name.as_deref().filter(|name| !name.trim().is_empty())
        else {
            warn!(
                target = "permit.pipeline",
                lead_id = lead.id,
                "lead has no name to use as registration number"
            );
            return;
        };

        match registry.lookup(reg_number).await {
            Ok(Some(entry)) => {
                merge_registry_entry(permit_info, &entry);
                info!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    permit_number = permit_info
                        .get("permit_number")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("-"),
                    "registry data merged"
                );
            }
            Ok(None) => {
                warn!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    reg_number,
                    "registry returned no entries"
                );
            }
            Err(err) => {
                warn!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    error = %err,
                    "registry lookup failed, leaving permit fields unset"
                );
            }
        }
    }

    /// Deadline computation is best-effort: an unrecognized category skips
    /// silently, a classifier failure logs and leaves the field unset.
    async fn attach_ready_at(&self, lead: &Lead, permit_info: &mut Map<String, Value>) {
        let Some(category) = permit_info
            .get("pass_type")
            .and_then(Value::as_str)
            .and_then(resolve_category)
        else {
            return;
        };
        let submitted_at = lead
            .updated_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        match self.calendar.compute_ready_at(submitted_at, category).await {
            Ok(ready) => {
                permit_info.insert("ready_at".into(), Value::String(ready.formatted));
            }
            Err(err) => {
                warn!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    error = %err,
                    "deadline computation failed, skipping ready_at"
                );
            }
        }
    }

    async fn resolve_manager(&self, lead: &Lead) -> Value {
        let Some(user_id) = lead.responsible_user_id else {
            return json!({});
        };
        let mut contact = match self.crm.user(user_id).await {
            Ok(Some(user)) => json!({ "id": user.id, "name": user.name }),
            Ok(None) => json!({ "id": user_id }),
            Err(err) => {
                warn!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    user_id,
                    error = %err,
                    "responsible user lookup failed"
                );
                json!({ "id": user_id })
            }
        };
        if let Some(profile) = manager_profile(user_id)
            && let Ok(Value::Object(extra)) = serde_json::to_value(profile)
            && let Some(base) = contact.as_object_mut()
        {
            for (key, value) in extra {
                base.entry(key).or_insert(value);
            }
        }
        contact
    }

    async fn maybe_generate_image(
        &self,
        lead: &Lead,
        car_info: &Map<String, Value>,
    ) -> Option<String> {
        let imagegen = self.imagegen.as_ref()?;
        if car_info.contains_key(IMAGE_URL_KEY) {
            return None;
        }
        let brand_model = car_info
            .get("brand_model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())?;

        match imagegen.generate(brand_model).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(
                    target = "permit.pipeline",
                    lead_id = lead.id,
                    error = %err,
                    "image generation failed, proceeding without image"
                );
                None
            }
        }
    }

    /// Fire-and-forget: the tracking link note must never fail the
    /// reconciliation that already committed.
    async fn post_tracking_link(&self, lead_id: i64, slug: &str) {
        let link = format!("{}/{slug}", self.track_base.trim_end_matches('/'));
        match self
            .crm
            .add_note(lead_id, &format!("Ссылка на трекинг: {link}"))
            .await
        {
            Ok(()) => info!(target = "permit.pipeline", lead_id, link, "tracking link posted"),
            Err(err) => warn!(
                target = "permit.pipeline",
                lead_id,
                error = %err,
                "tracking link note failed"
            ),
        }
    }
}

/// Splits the CRM's flat custom-field list into vehicle and permit groups
/// by field id. Unmapped fields stay under their raw field name for
/// forward compatibility.
pub fn map_custom_fields(fields: &[CustomField]) -> (Map<String, Value>, Map<String, Value>) {
    let mut car_info = Map::new();
    let mut permit_info = Map::new();

    for field in fields {
        let Some(value) = field.values.first().map(|v| v.value.clone()) else {
            continue;
        };
        match field.field_id {
            // Тип пропуска (Временный / 6 месяцев / 12 месяцев)
            1_043_841 | 744_117 => {
                permit_info.insert("pass_type".into(), value);
            }
            // Зона
            744_115 => {
                permit_info.insert("zone".into(), value);
            }
            // VIN
            924_745 => {
                car_info.insert("vin".into(), value);
            }
            // Марка, модель
            924_747 => {
                car_info.insert("brand_model".into(), value);
            }
            // Диагностическая карта
            1_175_381 => {
                car_info.insert("diagnostic_card".into(), value);
            }
            // Дата действия ДК
            1_175_385 => {
                car_info.insert("diagnostic_card_valid_until".into(), value);
            }
            other => {
                let key = field
                    .field_name
                    .clone()
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| format!("field_{other}"));
                car_info.insert(key, value);
            }
        }
    }

    (car_info, permit_info)
}

/// Enrichment results are append-only per lead: a fresh CRM fetch that
/// omits them must not clear what an earlier cycle stored.
fn carry_forward(
    car_info: &mut Map<String, Value>,
    permit_info: &mut Map<String, Value>,
    existing: Option<&OrderProjection>,
) {
    let Some(existing) = existing else {
        return;
    };

    if !car_info.contains_key(IMAGE_URL_KEY)
        && let Some(url) = existing.car_info.get(IMAGE_URL_KEY)
    {
        car_info.insert(IMAGE_URL_KEY.into(), url.clone());
    }

    for key in CARRIED_PERMIT_KEYS {
        if !permit_info.contains_key(*key)
            && let Some(value) = existing.permit_info.get(*key)
        {
            permit_info.insert((*key).to_string(), value.clone());
        }
    }
}

fn merge_registry_entry(permit_info: &mut Map<String, Value>, entry: &RegistryEntry) {
    let direct = [
        ("permit_series", entry.series.as_ref()),
        ("permit_number", entry.number.as_ref()),
        ("valid_from", entry.start_date.as_ref()),
        ("valid_until", entry.validity_date.as_ref()),
        ("registry_status", entry.status.as_ref()),
    ];
    for (key, value) in direct {
        if let Some(value) = value {
            permit_info.insert(key.into(), Value::String(value.clone()));
        }
    }
    // Zone and type from the CRM win; the registry only fills gaps.
    if let Some(zone) = &entry.zone {
        permit_info
            .entry("zone")
            .or_insert_with(|| Value::String(zone.clone()));
    }
    if let Some(permit_type) = &entry.permit_type {
        permit_info
            .entry("pass_type")
            .or_insert_with(|| Value::String(permit_type.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amo::client::CustomFieldValue;
    use crate::imagegen::ImageGenError;
    use crate::registry::RegistryError;
    use crate::store::generate_slug;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct MockCrm {
        leads: HashMap<i64, Lead>,
        users: HashMap<i64, crate::amo::User>,
        notes: Mutex<Vec<(i64, String)>>,
    }

    impl MockCrm {
        fn new() -> Self {
            Self {
                leads: HashMap::new(),
                users: HashMap::new(),
                notes: Mutex::new(Vec::new()),
            }
        }

        fn with_lead(mut self, lead: Lead) -> Self {
            self.leads.insert(lead.id, lead);
            self
        }

        fn with_user(mut self, id: i64, name: &str) -> Self {
            self.users.insert(
                id,
                crate::amo::User {
                    id,
                    name: name.to_string(),
                },
            );
            self
        }
    }

    #[async_trait]
    impl CrmApi for MockCrm {
        async fn lead(&self, id: i64) -> Result<Option<Lead>, CrmError> {
            Ok(self.leads.get(&id).cloned())
        }

        async fn user(&self, id: i64) -> Result<Option<crate::amo::User>, CrmError> {
            Ok(self.users.get(&id).cloned())
        }

        async fn add_note(&self, lead_id: i64, text: &str) -> Result<(), CrmError> {
            self.notes.lock().await.push((lead_id, text.to_string()));
            Ok(())
        }
    }

    /// Weekday-only calendar so deadline tests stay offline.
    struct WeekdayCalendar;

    #[async_trait]
    impl DayClassifier for WeekdayCalendar {
        async fn day_code(&self, date: NaiveDate) -> Result<u8, CalendarError> {
            use chrono::{Datelike, Weekday};
            match date.weekday() {
                Weekday::Sat | Weekday::Sun => Ok(1),
                _ => Ok(0),
            }
        }
    }

    fn field(id: i64, name: &str, value: Value) -> CustomField {
        CustomField {
            field_id: id,
            field_name: Some(name.to_string()),
            values: vec![CustomFieldValue { value }],
        }
    }

    fn lead(id: i64, status_id: i64, fields: Vec<CustomField>) -> Lead {
        Lead {
            id,
            name: Some("А123ВС777".to_string()),
            status_id,
            responsible_user_id: Some(501),
            updated_at: Some(1_772_000_000),
            custom_fields_values: Some(fields),
        }
    }

    /// Scripted registry: every lookup returns the same entry and bumps a
    /// shared counter the test keeps a handle on.
    struct MockRegistry {
        entry: Option<RegistryEntry>,
        calls: Arc<AtomicUsize>,
    }

    impl MockRegistry {
        fn returning(entry: Option<RegistryEntry>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    entry,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl PermitRegistry for MockRegistry {
        async fn lookup(
            &self,
            _reg_number: &str,
        ) -> Result<Option<RegistryEntry>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entry.clone())
        }
    }

    struct MockRenderer {
        calls: Arc<AtomicUsize>,
    }

    impl MockRenderer {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl ImageRenderer for MockRenderer {
        async fn generate(&self, model_description: &str) -> Result<String, ImageGenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://img.example/{model_description}.png"))
        }
    }

    fn pipeline_with(
        store: Arc<MemoryStore>,
        crm: Arc<MockCrm>,
        registry: Option<MockRegistry>,
        renderer: Option<MockRenderer>,
    ) -> Pipeline<MemoryStore, MockCrm, WeekdayCalendar, MockRegistry, MockRenderer> {
        Pipeline::new(
            store,
            crm,
            DeadlineCalculator::new(WeekdayCalendar),
            registry,
            renderer,
            "https://track.example.com/track",
        )
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        crm: Arc<MockCrm>,
    ) -> Pipeline<MemoryStore, MockCrm, WeekdayCalendar, MockRegistry, MockRenderer> {
        pipeline_with(store, crm, None, None)
    }

    #[test]
    fn custom_field_mapping_splits_groups() {
        let (car, permit) = map_custom_fields(&[
            field(924_745, "VIN", json!("XTA210990Y1234567")),
            field(924_747, "Марка модель", json!("Lada Vesta SW Cross")),
            field(744_115, "Зона", json!("ТТК")),
            field(744_117, "Тип пропуска", json!("Временный")),
            field(555, "Цвет", json!("белый")),
        ]);
        assert_eq!(car.get("vin"), Some(&json!("XTA210990Y1234567")));
        assert_eq!(car.get("brand_model"), Some(&json!("Lada Vesta SW Cross")));
        assert_eq!(car.get("Цвет"), Some(&json!("белый")));
        assert_eq!(permit.get("zone"), Some(&json!("ТТК")));
        assert_eq!(permit.get("pass_type"), Some(&json!("Временный")));
    }

    #[test]
    fn unmapped_field_without_name_keeps_id_key() {
        let (car, _) = map_custom_fields(&[CustomField {
            field_id: 999,
            field_name: None,
            values: vec![CustomFieldValue { value: json!(7) }],
        }]);
        assert_eq!(car.get("field_999"), Some(&json!(7)));
    }

    #[test]
    fn merge_preserves_previous_image_url() {
        let existing = OrderProjection {
            amo_lead_id: 1,
            hash_slug: None,
            status_id: 41_138_689,
            status_step: 2,
            status_label: None,
            car_info: json!({ "image_url": "X", "vin": "old" }),
            permit_info: json!({}),
            manager_contact: json!({}),
            updated_at: Utc::now(),
        };
        let mut car = Map::new();
        car.insert("vin".into(), json!("new"));
        let mut permit = Map::new();
        carry_forward(&mut car, &mut permit, Some(&existing));
        assert_eq!(car.get("image_url"), Some(&json!("X")));
        // Non-enrichment fields: the fresh fetch wins.
        assert_eq!(car.get("vin"), Some(&json!("new")));
    }

    #[test]
    fn merge_preserves_registry_fields() {
        let existing = OrderProjection {
            amo_lead_id: 1,
            hash_slug: None,
            status_id: 41_138_695,
            status_step: 4,
            status_label: None,
            car_info: json!({}),
            permit_info: json!({
                "permit_number": "123456",
                "valid_until": "01.06.2026",
                "zone": "old-zone",
            }),
            manager_contact: json!({}),
            updated_at: Utc::now(),
        };
        let mut car = Map::new();
        let mut permit = Map::new();
        permit.insert("zone".into(), json!("СК"));
        carry_forward(&mut car, &mut permit, Some(&existing));
        assert_eq!(permit.get("permit_number"), Some(&json!("123456")));
        assert_eq!(permit.get("valid_until"), Some(&json!("01.06.2026")));
        // Zone comes from the CRM fetch, not carried.
        assert_eq!(permit.get("zone"), Some(&json!("СК")));
    }

    #[test]
    fn registry_entry_merge_respects_crm_zone() {
        let mut permit = Map::new();
        permit.insert("zone".into(), json!("ТТК"));
        merge_registry_entry(
            &mut permit,
            &RegistryEntry {
                status: Some("Выдан".into()),
                series: Some("АА".into()),
                number: Some("007".into()),
                start_date: Some("01.01.2026".into()),
                validity_date: Some("01.06.2026".into()),
                zone: Some("СК".into()),
                permit_type: Some("ночной".into()),
            },
        );
        assert_eq!(permit.get("permit_series"), Some(&json!("АА")));
        assert_eq!(permit.get("permit_number"), Some(&json!("007")));
        assert_eq!(permit.get("valid_from"), Some(&json!("01.01.2026")));
        assert_eq!(permit.get("valid_until"), Some(&json!("01.06.2026")));
        assert_eq!(permit.get("registry_status"), Some(&json!("Выдан")));
        assert_eq!(permit.get("zone"), Some(&json!("ТТК")));
        assert_eq!(permit.get("pass_type"), Some(&json!("ночной")));
    }

    #[tokio::test]
    async fn first_webhook_inserts_row_and_posts_one_note() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(
                    1001,
                    41_138_689,
                    vec![field(924_747, "Марка модель", json!("Kia Rio"))],
                ))
                .with_user(501, "Мария"),
        );
        let pipeline = pipeline(store.clone(), crm.clone());

        pipeline.process_lead(1001, None).await.expect("process");

        let saved = store
            .get_by_lead_id(1001)
            .await
            .unwrap()
            .expect("projection");
        assert_eq!(saved.status_step, 2);
        assert_eq!(saved.hash_slug.as_deref(), Some(generate_slug(1001).as_str()));
        assert_eq!(saved.manager_contact, json!({ "id": 501, "name": "Мария" }));

        let notes = crm.notes.lock().await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, 1001);
        assert!(notes[0].1.contains(&generate_slug(1001)));
    }

    #[tokio::test]
    async fn repeat_webhook_does_not_post_second_note() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(1001, 41_138_689, Vec::new()))
                .with_user(501, "Мария"),
        );
        let pipeline = pipeline(store.clone(), crm.clone());

        pipeline.process_lead(1001, None).await.expect("first");
        pipeline.process_lead(1001, None).await.expect("second");

        assert_eq!(crm.notes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_lead_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(MockCrm::new());
        let pipeline = pipeline(store.clone(), crm);

        pipeline.process_lead(404_404, None).await.expect("skip");
        assert!(store.get_by_lead_id(404_404).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn documents_submitted_attaches_ready_at() {
        let store = Arc::new(MemoryStore::default());
        // 2026-02-25 07:33:20 UTC is a Wednesday morning in MSK.
        let mut submitted = lead(
            2002,
            41_138_692,
            vec![field(744_117, "Тип пропуска", json!("Временный"))],
        );
        submitted.updated_at = Some(1_771_997_600);
        let crm = Arc::new(MockCrm::new().with_lead(submitted).with_user(501, "Мария"));
        let pipeline = pipeline(store.clone(), crm);

        pipeline.process_lead(2002, None).await.expect("process");

        let saved = store.get_by_lead_id(2002).await.unwrap().expect("row");
        assert_eq!(saved.status_step, 3);
        let ready_at = saved
            .permit_info
            .get("ready_at")
            .and_then(Value::as_str)
            .expect("ready_at set");
        assert!(ready_at.ends_with("(МСК)"), "got {ready_at}");
    }

    #[tokio::test]
    async fn unknown_category_skips_ready_at() {
        let store = Arc::new(MemoryStore::default());
        let submitted = lead(
            2003,
            41_138_692,
            vec![field(744_117, "Тип пропуска", json!("разовый"))],
        );
        let crm = Arc::new(MockCrm::new().with_lead(submitted).with_user(501, "Мария"));
        let pipeline = pipeline(store.clone(), crm);

        pipeline.process_lead(2003, None).await.expect("process");
        let saved = store.get_by_lead_id(2003).await.unwrap().expect("row");
        assert!(saved.permit_info.get("ready_at").is_none());
    }

    #[tokio::test]
    async fn stored_enrichment_survives_later_updates() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert(NewOrder {
                amo_lead_id: 3003,
                status_id: 41_138_689,
                status_step: None,
                status_label: Some("А123ВС777".into()),
                car_info: json!({ "image_url": "https://img.example/3003.png" }),
                permit_info: json!({ "permit_number": "555", "ready_at": "2026-03-05 10:00 (МСК)" }),
                manager_contact: json!({}),
            })
            .await
            .unwrap();

        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(3003, 41_138_695, Vec::new()))
                .with_user(501, "Мария"),
        );
        let pipeline = pipeline(store.clone(), crm);
        pipeline.process_lead(3003, None).await.expect("process");

        let saved = store.get_by_lead_id(3003).await.unwrap().expect("row");
        assert_eq!(saved.status_step, 4);
        assert_eq!(
            saved.car_info.get("image_url"),
            Some(&json!("https://img.example/3003.png"))
        );
        assert_eq!(saved.permit_info.get("permit_number"), Some(&json!("555")));
        assert_eq!(
            saved.permit_info.get("ready_at"),
            Some(&json!("2026-03-05 10:00 (МСК)"))
        );
        // Slug assigned earlier is still there after the released status.
        assert_eq!(saved.hash_slug.as_deref(), Some(generate_slug(3003).as_str()));
    }

    fn issued_entry(number: &str) -> RegistryEntry {
        RegistryEntry {
            status: Some("выдан".into()),
            series: Some("АА".into()),
            number: Some(number.into()),
            start_date: Some("01.01.2026".into()),
            validity_date: Some("01.06.2026".into()),
            zone: None,
            permit_type: None,
        }
    }

    #[tokio::test]
    async fn released_transition_merges_registry_data() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(4004, 41_138_695, Vec::new()))
                .with_user(501, "Мария"),
        );
        let (registry, lookups) = MockRegistry::returning(Some(issued_entry("001122")));
        let pipeline = pipeline_with(store.clone(), crm, Some(registry), None);

        pipeline
            .process_lead(
                4004,
                Some(StatusChange {
                    lead_id: 4004,
                    old_status_id: Some(41_138_692),
                }),
            )
            .await
            .expect("process");

        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        let saved = store.get_by_lead_id(4004).await.unwrap().expect("row");
        assert_eq!(saved.permit_info.get("permit_number"), Some(&json!("001122")));
        assert_eq!(saved.permit_info.get("permit_series"), Some(&json!("АА")));
        assert_eq!(saved.permit_info.get("valid_until"), Some(&json!("01.06.2026")));
    }

    #[tokio::test]
    async fn unchanged_status_skips_registry_lookup() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(4005, 41_138_695, Vec::new()))
                .with_user(501, "Мария"),
        );
        let (registry, lookups) = MockRegistry::returning(Some(issued_entry("001122")));
        let pipeline = pipeline_with(store.clone(), crm, Some(registry), None);

        // Redelivery where the old status equals the current one.
        pipeline
            .process_lead(
                4005,
                Some(StatusChange {
                    lead_id: 4005,
                    old_status_id: Some(41_138_695),
                }),
            )
            .await
            .expect("redelivery");
        // Plain update with no status section at all.
        pipeline.process_lead(4005, None).await.expect("update");

        assert_eq!(lookups.load(Ordering::SeqCst), 0);
        let saved = store.get_by_lead_id(4005).await.unwrap().expect("row");
        assert!(saved.permit_info.get("permit_number").is_none());
    }

    #[tokio::test]
    async fn stored_permit_data_suppresses_registry_lookup() {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert(NewOrder {
                amo_lead_id: 4006,
                status_id: 41_138_695,
                status_step: None,
                status_label: Some("А123ВС777".into()),
                car_info: json!({}),
                permit_info: json!({ "permit_number": "555" }),
                manager_contact: json!({}),
            })
            .await
            .unwrap();
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(4006, 41_138_695, Vec::new()))
                .with_user(501, "Мария"),
        );
        let (registry, lookups) = MockRegistry::returning(Some(issued_entry("999")));
        let pipeline = pipeline_with(store.clone(), crm, Some(registry), None);

        pipeline
            .process_lead(
                4006,
                Some(StatusChange {
                    lead_id: 4006,
                    old_status_id: Some(41_138_692),
                }),
            )
            .await
            .expect("process");

        assert_eq!(lookups.load(Ordering::SeqCst), 0);
        let saved = store.get_by_lead_id(4006).await.unwrap().expect("row");
        assert_eq!(saved.permit_info.get("permit_number"), Some(&json!("555")));
    }

    #[tokio::test]
    async fn image_generation_runs_once_and_persists() {
        let store = Arc::new(MemoryStore::default());
        let crm = Arc::new(
            MockCrm::new()
                .with_lead(lead(
                    5005,
                    41_138_689,
                    vec![field(924_747, "Марка модель", json!("KiaRio"))],
                ))
                .with_user(501, "Мария"),
        );
        let (renderer, renders) = MockRenderer::new();
        let pipeline = pipeline_with(store.clone(), crm, None, Some(renderer));

        pipeline.process_lead(5005, None).await.expect("first");
        let saved = store.get_by_lead_id(5005).await.unwrap().expect("row");
        assert_eq!(
            saved.car_info.get("image_url"),
            Some(&json!("https://img.example/KiaRio.png"))
        );
        assert_eq!(renders.load(Ordering::SeqCst), 1);

        // The stored image is carried forward, so a redelivery does not
        // render again.
        pipeline.process_lead(5005, None).await.expect("second");
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        let saved = store.get_by_lead_id(5005).await.unwrap().expect("row");
        assert_eq!(
            saved.car_info.get("image_url"),
            Some(&json!("https://img.example/KiaRio.png"))
        );
    }
}
