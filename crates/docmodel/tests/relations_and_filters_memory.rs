use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use serde_json::json;
use std::sync::Arc;

use docmodel::prelude::*;
use docmodel::{Document, EntityInfo, FilterRegistry, LazyMany, LazyOne};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

// ============================================================================
// Relations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Customer {
    #[serde(flatten)]
    meta: EntityMeta,
    name: String,
}

impl Entity for Customer {
    const DISCRIMINATOR: &'static str = "Customer";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

impl Customer {
    fn orders_relation(&self) -> Arc<LazyMany<Customer, Order>> {
        self.meta.relations().many("orders", || {
            LazyMany::new(
                "orders",
                |c: &Customer| Filter::eq("customer_id", c.id().unwrap_or_default()),
                |cs: &[&Customer]| {
                    Filter::in_list("customer_id", cs.iter().map(|c| c.id().unwrap_or_default().to_string()))
                },
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    #[serde(flatten)]
    meta: EntityMeta,
    customer_id: String,
    total: i64,
}

impl Entity for Order {
    const DISCRIMINATOR: &'static str = "Order";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

impl Order {
    fn unsaved(customer_id: &str) -> Self {
        Self {
            meta: EntityMeta::new(),
            customer_id: customer_id.to_string(),
            total: 0,
        }
    }

    fn customer_relation(&self) -> Arc<LazyOne<Order, Customer>> {
        self.meta.relations().one("customer", || {
            LazyOne::new(
                "customer",
                |o: &Order| Filter::id(o.customer_id.clone()),
                |os: &[&Order]| Filter::ids(os.iter().map(|o| o.customer_id.clone())),
            )
        })
    }
}

fn shop(store: &MemoryStore) -> UnitOfWorkFactory<MemoryStore> {
    store.insert_raw("customers", doc(json!({"_id": "c1", "name": "Ada"})));
    store.insert_raw("customers", doc(json!({"_id": "c2", "name": "Grace"})));
    store.insert_raw("orders", doc(json!({"_id": "o1", "customer_id": "c1", "total": 10})));
    store.insert_raw("orders", doc(json!({"_id": "o2", "customer_id": "c1", "total": 20})));
    store.insert_raw("orders", doc(json!({"_id": "o3", "customer_id": "c2", "total": 30})));

    let registry = EntityRegistry::builder()
        .family::<Customer>("customers")
        .family::<Order>("orders")
        .build()
        .unwrap();
    UnitOfWorkFactory::new(store.clone(), Arc::new(registry))
}

#[test]
fn lazy_one_loads_once_and_caches() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = shop(&store);
    let order = Order::unsaved("c1");

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        store.reset_stats();

        let relation = order.customer_relation();
        assert!(!relation.is_loaded());
        let first = unwrap_outcome(relation.resolve(&cx, &order, &uow).await).unwrap();
        assert_eq!(first.read().unwrap().name, "Ada");

        let second = unwrap_outcome(order.customer_relation().resolve(&cx, &order, &uow).await).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.stats().find_calls, 1);

        // The related entity is tracked like any other query result.
        assert!(uow.is_tracked::<Customer>("c1"));
        uow.dispose(&cx).await;
    });
}

#[test]
fn lazy_many_loads_the_owner_collection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = shop(&store);

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        let ada = unwrap_outcome(uow.find_by_id::<Customer>(&cx, "c1").await).unwrap();
        // Take the descriptor from the tracked instance; the owner copy only
        // feeds the load rule, so no lock is held across the await.
        let (relation, owner) = {
            let guard = ada.read().unwrap();
            (guard.orders_relation(), guard.clone())
        };

        let orders = unwrap_outcome(relation.resolve(&cx, &owner, &uow).await);
        let mut totals: Vec<i64> = orders.iter().map(|o| o.read().unwrap().total).collect();
        totals.sort_unstable();
        assert_eq!(totals, vec![10, 20]);
        assert!(ada.read().unwrap().orders_relation().is_loaded());
        assert!(!owner.orders_relation().is_loaded());
        uow.dispose(&cx).await;
    });
}

#[test]
fn batch_load_primes_every_owner_with_one_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = shop(&store);
    let orders = [Order::unsaved("c1"), Order::unsaved("c2"), Order::unsaved("c1")];

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        store.reset_stats();

        let owners: Vec<&Order> = orders.iter().collect();
        let primed = unwrap_outcome(
            LazyOne::load_batch(&cx, &owners, |o: &Order| o.customer_relation(), &uow).await,
        );
        assert_eq!(primed, 3);
        assert_eq!(store.stats().find_calls, 1);

        let names: Vec<String> = orders
            .iter()
            .map(|o| {
                let customer = o.customer_relation().get().flatten().unwrap();
                let name = customer.read().unwrap().name.clone();
                name
            })
            .collect();
        assert_eq!(names, vec!["Ada", "Grace", "Ada"]);

        // Already primed owners are skipped.
        let primed = unwrap_outcome(
            LazyOne::load_batch(&cx, &owners, |o: &Order| o.customer_relation(), &uow).await,
        );
        assert_eq!(primed, 0);
        assert_eq!(store.stats().find_calls, 1);
        uow.dispose(&cx).await;
    });
}

#[test]
fn repeated_single_loads_are_flagged() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = shop(&store).with_config(UnitOfWorkConfig::new().n1_threshold(2));
    let orders = [Order::unsaved("c1"), Order::unsaved("c2"), Order::unsaved("c1")];

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        for order in &orders {
            unwrap_outcome(order.customer_relation().resolve(&cx, order, &uow).await);
        }

        let stats = uow.n1_stats().unwrap();
        assert_eq!(stats.total_loads, 3);
        assert_eq!(stats.relations_loaded, 1);
        assert_eq!(stats.potential_n1, 1);

        uow.reset_n1_tracking();
        assert_eq!(uow.n1_stats().unwrap().total_loads, 0);
        uow.disable_n1_detection();
        assert!(uow.n1_stats().is_none());
        uow.dispose(&cx).await;
    });
}

// ============================================================================
// Data filters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Invoice {
    #[serde(flatten)]
    meta: EntityMeta,
    tenant: String,
    archived: bool,
}

impl Entity for Invoice {
    const DISCRIMINATOR: &'static str = "Invoice";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

struct TenantScoped;
impl Capability for TenantScoped {}

struct Archivable;
impl Capability for Archivable {}

struct CurrentTenant(String);

struct TenantFilter {
    tenant: String,
}

impl DataFilter for TenantFilter {
    fn pre_filter(&self, _entity: &EntityInfo, filter: Filter) -> Filter {
        filter.and(Filter::eq("tenant", self.tenant.clone()))
    }
}

struct HideArchived;

impl DataFilter for HideArchived {
    fn pre_filter(&self, _entity: &EntityInfo, filter: Filter) -> Filter {
        filter
    }

    fn post_filter(&self, _entity: &EntityInfo) -> Option<Filter> {
        Some(Filter::eq("archived", false))
    }
}

fn billing(store: &MemoryStore, filters: FilterRegistry) -> UnitOfWorkFactory<MemoryStore> {
    store.insert_raw("invoices", doc(json!({"_id": "i1", "tenant": "acme", "archived": false})));
    store.insert_raw("invoices", doc(json!({"_id": "i2", "tenant": "acme", "archived": true})));
    store.insert_raw("invoices", doc(json!({"_id": "i3", "tenant": "globex", "archived": false})));

    let registry = EntityRegistry::builder()
        .family::<Invoice>("invoices")
        .capability::<TenantScoped>()
        .capability::<Archivable>()
        .family::<Customer>("customers")
        .build()
        .unwrap();
    let services = ServiceMap::new().with(CurrentTenant("acme".to_string()));
    UnitOfWorkFactory::new(store.clone(), Arc::new(registry))
        .with_filters(Arc::new(filters))
        .with_services(Arc::new(services))
}

fn tenant_filters() -> FilterRegistry {
    let filters = FilterRegistry::new();
    filters.register::<TenantScoped, _>(|services| {
        services
            .resolve::<CurrentTenant>()
            .map(|tenant| TenantFilter {
                tenant: tenant.0.clone(),
            })
    });
    filters
}

fn ids(invoices: &[Invoice]) -> Vec<String> {
    let mut ids: Vec<String> = invoices
        .iter()
        .filter_map(|i| i.id().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

#[test]
fn tenant_filter_scopes_queries_until_suspended() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = billing(&store, tenant_filters());

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        let scoped = unwrap_outcome(uow.query_no_tracking::<Invoice>(&cx, Filter::All).await);
        assert_eq!(ids(&scoped), vec!["i1", "i2"]);

        {
            let suspension = uow.disable_filter::<TenantScoped>();
            assert_eq!(suspension.suspended(), 1);
            let all = unwrap_outcome(uow.query_no_tracking::<Invoice>(&cx, Filter::All).await);
            assert_eq!(all.len(), 3);
        }

        let restored = unwrap_outcome(uow.query_no_tracking::<Invoice>(&cx, Filter::All).await);
        assert_eq!(ids(&restored), vec!["i1", "i2"]);
        assert_eq!(unwrap_outcome(uow.count::<Invoice>(&cx, Filter::All).await), 2);

        // Types without the capability are not filtered.
        assert_eq!(unwrap_outcome(uow.count::<Customer>(&cx, Filter::All).await), 0);
        uow.dispose(&cx).await;
    });
}

#[test]
fn filtered_delete_spares_other_tenants() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = billing(&store, tenant_filters());

    let deleted = rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        let deleted = unwrap_outcome(uow.delete_ids::<Invoice>(&cx, &["i2".to_string(), "i3".to_string()]).await);
        uow.dispose(&cx).await;
        deleted
    });

    assert_eq!(deleted, 1);
    assert!(store.document("invoices", "i2").is_none());
    assert!(store.document("invoices", "i3").is_some());
}

#[test]
fn removed_filter_no_longer_applies() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = billing(&store, tenant_filters());

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        assert_eq!(unwrap_outcome(uow.count::<Invoice>(&cx, Filter::All).await), 2);

        assert!(factory.filters().remove::<TenantScoped>());
        assert_eq!(unwrap_outcome(uow.count::<Invoice>(&cx, Filter::All).await), 3);
        uow.dispose(&cx).await;
    });
}

#[test]
fn post_filter_hides_rows_and_blocks_counting() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let filters = tenant_filters();
    filters.register::<Archivable, _>(|_| Some(HideArchived));
    let factory = billing(&store, filters);

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        let visible = unwrap_outcome(uow.query::<Invoice>(&cx, Filter::All).await);
        assert_eq!(visible.len(), 1);
        assert!(!visible[0].read().unwrap().archived);

        match uow.count::<Invoice>(&cx, Filter::All).await {
            Outcome::Err(Error::UnsupportedPostFilterCount { entity_type }) => {
                assert_eq!(entity_type, "Invoice");
            }
            other => panic!("expected a post-filter count error, got {other:?}"),
        }

        let _all = uow.disable_all_filters();
        assert_eq!(unwrap_outcome(uow.count::<Invoice>(&cx, Filter::All).await), 3);
        uow.dispose(&cx).await;
    });
}

#[test]
fn missing_service_leaves_the_filter_inactive() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let factory = billing(&store, tenant_filters()).with_services(Arc::new(ServiceMap::new()));

    rt.block_on(async {
        let uow = unwrap_outcome(factory.open(&cx).await);
        assert_eq!(unwrap_outcome(uow.count::<Invoice>(&cx, Filter::All).await), 3);
        assert!(uow.filters().active().is_empty());
        uow.dispose(&cx).await;
    });
}
