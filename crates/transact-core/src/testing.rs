//! Aggregates shared by the unit tests.

use std::thread;
use std::time::Duration;

use crate::args::Args;
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::reference::Reference;
use crate::schema::{Aggregate, ParamKind, SchemaBuilder, TransactionType};

#[derive(Debug, Default)]
pub(crate) struct TestTransaction;

impl Aggregate for TestTransaction {
    const TYPE_NAME: &'static str = "TestTransaction";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.creates::<TestEntity>(
            "CreateTestEntity",
            &[("name", ParamKind::Text)],
            |args| {
                Ok(TestEntity {
                    name: args.text("name")?.to_string(),
                    ..TestEntity::default()
                })
            },
        );
    }
}

impl TransactionType for TestTransaction {}

#[derive(Debug, Default)]
pub(crate) struct TestEntity {
    pub(crate) name: String,
    pub(crate) state: String,
    pub(crate) testparametr: i64,
}

impl Aggregate for TestEntity {
    const TYPE_NAME: &'static str = "TestEntity";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema
            .event("SetName", &[("name", ParamKind::Text)], |e, args| {
                e.name = args.text("name")?.to_string();
                Ok(())
            })
            .event("MakeOperation1", &[("value", ParamKind::Int)], |e, args| {
                e.state = "AfterMakeOperation1".into();
                e.testparametr = args.int("value")?;
                Ok(())
            })
            .event("Rename", &[("name", ParamKind::Text)], |e, args| {
                e.name = args.text("name")?.to_string();
                Ok(())
            })
            .event(
                "Rename",
                &[("name", ParamKind::Text), ("suffix", ParamKind::Text)],
                |e, args| {
                    e.name = format!("{}{}", args.text("name")?, args.text("suffix")?);
                    Ok(())
                },
            )
            .creates::<ChildTestEntity>("CreateChild", &[("name", ParamKind::Text)], |args| {
                Ok(ChildTestEntity {
                    name: args.text("name")?.to_string(),
                })
            });
    }
}

#[derive(Debug)]
pub(crate) struct ChildTestEntity {
    pub(crate) name: String,
}

impl Aggregate for ChildTestEntity {
    const TYPE_NAME: &'static str = "ChildTestEntity";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.event("SetName", &[("name", ParamKind::Text)], |e, args| {
            e.name = args.text("name")?.to_string();
            Ok(())
        });
    }
}

pub(crate) trait TestTransactionEvents {
    fn create_test_entity(&self, name: &str) -> CoreResult<Entity<TestEntity>>;
}

impl TestTransactionEvents for Entity<TestTransaction> {
    fn create_test_entity(&self, name: &str) -> CoreResult<Entity<TestEntity>> {
        self.create("CreateTestEntity", Args::new().with("name", name))
    }
}

pub(crate) trait TestEntityEvents {
    fn set_name(&self, name: &str) -> CoreResult<()>;
    fn make_operation1(&self, value: i64) -> CoreResult<()>;
    fn rename(&self, name: &str) -> CoreResult<()>;
    fn rename_with_suffix(&self, name: &str, suffix: &str) -> CoreResult<()>;
    fn create_child(&self, name: &str) -> CoreResult<Entity<ChildTestEntity>>;
}

impl TestEntityEvents for Entity<TestEntity> {
    fn set_name(&self, name: &str) -> CoreResult<()> {
        self.emit("SetName", Args::new().with("name", name))
    }

    fn make_operation1(&self, value: i64) -> CoreResult<()> {
        self.emit("MakeOperation1", Args::new().with("value", value))
    }

    fn rename(&self, name: &str) -> CoreResult<()> {
        self.emit("Rename", Args::new().with("name", name))
    }

    fn rename_with_suffix(&self, name: &str, suffix: &str) -> CoreResult<()> {
        self.emit(
            "Rename",
            Args::new().with("name", name).with("suffix", suffix),
        )
    }

    fn create_child(&self, name: &str) -> CoreResult<Entity<ChildTestEntity>> {
        self.create("CreateChild", Args::new().with("name", name))
    }
}

#[derive(Debug, Default)]
pub(crate) struct OrderTransaction {
    pub(crate) approved_by: Option<String>,
}

impl Aggregate for OrderTransaction {
    const TYPE_NAME: &'static str = "OrderTransaction";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema
            .event("Approve", &[("approver", ParamKind::Text)], |t, args| {
                t.approved_by = Some(args.text("approver")?.to_string());
                Ok(())
            })
            .creates::<Customer>("CreateCustomer", &[("name", ParamKind::Text)], |args| {
                Ok(Customer {
                    name: args.text("name")?.to_string(),
                })
            })
            .creates::<Product>(
                "CreateProduct",
                &[("title", ParamKind::Text), ("price", ParamKind::Float)],
                |args| {
                    Ok(Product {
                        title: args.text("title")?.to_string(),
                        price: args.float("price")?,
                    })
                },
            )
            .creates::<Order>(
                "CreateOrder",
                &[("customer", ParamKind::entity::<Customer>())],
                |args| {
                    Ok(Order {
                        customer: args.optional_reference("customer")?,
                        lines: Vec::new(),
                        quoted: 0.0,
                    })
                },
            );
    }
}

impl TransactionType for OrderTransaction {
    const ROOT_EVENT_NAME: &'static str = "OrderPlaced";
}

#[derive(Debug)]
pub(crate) struct Customer {
    pub(crate) name: String,
}

impl Aggregate for Customer {
    const TYPE_NAME: &'static str = "Customer";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.event("Rename", &[("name", ParamKind::Text)], |c, args| {
            c.name = args.text("name")?.to_string();
            Ok(())
        });
    }
}

#[derive(Debug)]
pub(crate) struct Product {
    pub(crate) title: String,
    pub(crate) price: f64,
}

impl Aggregate for Product {
    const TYPE_NAME: &'static str = "Product";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema.event("Reprice", &[("price", ParamKind::Float)], |p, args| {
            p.price = args.float("price")?;
            Ok(())
        });
    }
}

#[derive(Debug)]
pub(crate) struct Order {
    pub(crate) customer: Option<Reference<Customer>>,
    pub(crate) lines: Vec<(Reference<Product>, i64)>,
    pub(crate) quoted: f64,
}

/// How long a `Quote` apply waits before reading the product, so tests can
/// change the product in the meantime.
pub(crate) const QUOTE_DELAY: Duration = Duration::from_millis(200);

impl Aggregate for Order {
    const TYPE_NAME: &'static str = "Order";

    fn schema(schema: &mut SchemaBuilder<Self>) {
        schema
            .event(
                "AssignCustomer",
                &[("customer", ParamKind::entity::<Customer>())],
                |o, args| {
                    o.customer = args.optional_reference("customer")?;
                    Ok(())
                },
            )
            .event(
                "AddLine",
                &[
                    ("product", ParamKind::entity::<Product>()),
                    ("quantity", ParamKind::Int),
                ],
                |o, args| {
                    o.lines
                        .push((args.reference("product")?, args.int("quantity")?));
                    Ok(())
                },
            )
            .event(
                "Quote",
                &[("product", ParamKind::entity::<Product>())],
                |o, args| {
                    thread::sleep(QUOTE_DELAY);
                    let product = args.reference::<Product>("product")?.load()?;
                    o.quoted = product.read(|p| p.price)?;
                    Ok(())
                },
            );
    }
}

pub(crate) trait OrderTransactionEvents {
    fn create_customer(&self, name: &str) -> CoreResult<Entity<Customer>>;
    fn create_product(&self, title: &str, price: f64) -> CoreResult<Entity<Product>>;
    fn create_order(&self, customer: &Entity<Customer>) -> CoreResult<Entity<Order>>;
    fn approve(&self, approver: &str) -> CoreResult<()>;
}

impl OrderTransactionEvents for Entity<OrderTransaction> {
    fn create_customer(&self, name: &str) -> CoreResult<Entity<Customer>> {
        self.create("CreateCustomer", Args::new().with("name", name))
    }

    fn create_product(&self, title: &str, price: f64) -> CoreResult<Entity<Product>> {
        self.create(
            "CreateProduct",
            Args::new().with("title", title).with("price", price),
        )
    }

    fn create_order(&self, customer: &Entity<Customer>) -> CoreResult<Entity<Order>> {
        self.create("CreateOrder", Args::new().with("customer", customer))
    }

    fn approve(&self, approver: &str) -> CoreResult<()> {
        self.emit("Approve", Args::new().with("approver", approver))
    }
}

pub(crate) trait OrderEvents {
    fn assign_customer(&self, customer: &Entity<Customer>) -> CoreResult<()>;
    fn add_line(&self, product: &Entity<Product>, quantity: i64) -> CoreResult<()>;
    fn quote(&self, product: &Entity<Product>) -> CoreResult<()>;
    fn customer(&self) -> CoreResult<Reference<Customer>>;
    fn lines(&self) -> CoreResult<Vec<(Reference<Product>, i64)>>;
}

impl OrderEvents for Entity<Order> {
    fn assign_customer(&self, customer: &Entity<Customer>) -> CoreResult<()> {
        self.emit("AssignCustomer", Args::new().with("customer", customer))
    }

    fn add_line(&self, product: &Entity<Product>, quantity: i64) -> CoreResult<()> {
        self.emit(
            "AddLine",
            Args::new().with("product", product).with("quantity", quantity),
        )
    }

    fn quote(&self, product: &Entity<Product>) -> CoreResult<()> {
        self.emit("Quote", Args::new().with("product", product))
    }

    fn customer(&self) -> CoreResult<Reference<Customer>> {
        self.read(|o| o.customer.clone())?
            .ok_or_else(|| CoreError::InvalidState("order has no customer".into()))
    }

    fn lines(&self) -> CoreResult<Vec<(Reference<Product>, i64)>> {
        self.read(|o| o.lines.clone())
    }
}

pub(crate) trait ProductEvents {
    fn reprice(&self, price: f64) -> CoreResult<()>;
}

impl ProductEvents for Entity<Product> {
    fn reprice(&self, price: f64) -> CoreResult<()> {
        self.emit("Reprice", Args::new().with("price", price))
    }
}

pub(crate) trait CustomerEvents {
    fn rename(&self, name: &str) -> CoreResult<()>;
    fn name(&self) -> CoreResult<String>;
}

impl CustomerEvents for Entity<Customer> {
    fn rename(&self, name: &str) -> CoreResult<()> {
        self.emit("Rename", Args::new().with("name", name))
    }

    fn name(&self) -> CoreResult<String> {
        self.read(|c| c.name.clone())
    }
}
