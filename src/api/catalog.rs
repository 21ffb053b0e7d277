//! Catalog reads guarded by the breaker and served from the pool
//!
//! Every read goes: breaker gate -> pooled connection -> SQLite -> outcome
//! recorded back into the breaker.

use async_trait::async_trait;
use hyper::{Response, StatusCode};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::router::{Handler, RequestContext, RouteSet};
use super::{error_response, json_response, BoxBody};
use crate::pool::{CatalogBreaker, PoolError, SqlitePool};

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Seconds clients are told to wait while the catalog is degraded
pub const RETRY_AFTER_SECS: u32 = 30;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS products (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL,
    price       REAL    NOT NULL DEFAULT 0,
    stock       INTEGER NOT NULL DEFAULT 0,
    category    TEXT    NOT NULL DEFAULT '',
    updated_at  TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(category);
";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog breaker is open")]
    ShortCircuited,

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// One catalog row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub stock: i64,
    pub category: String,
    pub updated_at: String,
}

impl Product {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            price: row.get(2)?,
            stock: row.get(3)?,
            category: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// A page of products plus the total matching count
#[derive(Debug, Clone)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl ProductPage {
    pub fn total_pages(&self) -> i64 {
        let size = i64::from(self.page_size.max(1));
        (self.total + size - 1) / size
    }
}

/// Create the products table if it does not exist
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Insert a handful of rows so a fresh database has something to serve
pub fn seed_sample(conn: &Connection) -> rusqlite::Result<usize> {
    let samples = [
        ("Vitamina C 1000mg", 12.5, 40, "vitaminas"),
        ("Magnesio Citrato", 15.9, 25, "minerales"),
        ("Omega 3 Aceite de Pescado", 21.0, 12, "aceites"),
        ("Cúrcuma con Pimienta Negra", 18.75, 0, "antiinflamatorios"),
        ("Ashwagandha KSM-66", 24.9, 8, "adaptogenos"),
    ];

    let mut stmt = conn.prepare("INSERT INTO products (name, price, stock, category) VALUES (?1, ?2, ?3, ?4)")?;
    for (name, price, stock, category) in samples {
        stmt.execute(params![name, price, stock, category])?;
    }
    Ok(samples.len())
}

/// `%value%` for a case-insensitive `LIKE ... ESCAPE '\'`, with wildcards in `value` matched literally
fn contains_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// One page of products; a page past the end is clamped to the last page
pub fn list_products(
    conn: &Connection,
    page: u32,
    page_size: u32,
    category: Option<&str>,
) -> rusqlite::Result<ProductPage> {
    let page_size = page_size.max(1);
    let pattern = category.map(contains_pattern);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM products WHERE (?1 IS NULL OR lower(category) LIKE ?1 ESCAPE '\\')",
        params![pattern],
        |row| row.get(0),
    )?;

    let last_page = ((total + i64::from(page_size) - 1) / i64::from(page_size)).max(1);
    let page = page.max(1).min(u32::try_from(last_page).unwrap_or(u32::MAX));
    let offset = i64::from(page - 1) * i64::from(page_size);

    let mut stmt = conn.prepare(
        "SELECT id, name, price, stock, category, updated_at FROM products
         WHERE (?1 IS NULL OR lower(category) LIKE ?1 ESCAPE '\\')
         ORDER BY id LIMIT ?2 OFFSET ?3",
    )?;
    let products = stmt
        .query_map(params![pattern, i64::from(page_size), offset], Product::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ProductPage {
        products,
        total,
        page,
        page_size,
    })
}

pub fn get_product(conn: &Connection, id: i64) -> rusqlite::Result<Option<Product>> {
    conn.query_row(
        "SELECT id, name, price, stock, category, updated_at FROM products WHERE id = ?1",
        params![id],
        Product::from_row,
    )
    .optional()
}

/// Catalog reads through the breaker and the pool
pub struct CatalogService {
    pool: Arc<SqlitePool>,
    breaker: Option<Arc<CatalogBreaker>>,
}

impl CatalogService {
    pub fn new(pool: Arc<SqlitePool>, breaker: Option<Arc<CatalogBreaker>>) -> Self {
        Self { pool, breaker }
    }

    /// Run a read query, short-circuiting while the breaker is open
    pub async fn read<T, F>(&self, query: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        // Held across the query; dropping it early frees a HalfOpen probe slot
        let permit = match &self.breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    debug!("Catalog read short-circuited");
                    return Err(CatalogError::ShortCircuited);
                }
            },
            None => None,
        };

        let result = match self.pool.with_connection(|conn| query(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CatalogError::Database(e)),
            Err(e) => Err(CatalogError::Pool(e)),
        };

        if let Some(permit) = permit {
            match &result {
                Ok(_) => permit.success(),
                Err(_) => permit.failure(),
            }
        }

        if let Err(e) = &result {
            warn!(error = %e, "Catalog read failed");
        }
        result
    }
}

fn degraded_response() -> Response<BoxBody> {
    let mut response = error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "CATALOG_DEGRADED",
        "Catalog temporarily unavailable",
    );
    let headers = response.headers_mut();
    headers.insert("x-backend-degraded", hyper::header::HeaderValue::from_static("true"));
    headers.insert(hyper::header::RETRY_AFTER, RETRY_AFTER_SECS.into());
    response
}

fn catalog_error_response(error: &CatalogError) -> Response<BoxBody> {
    match error {
        CatalogError::ShortCircuited | CatalogError::Database(_) => degraded_response(),
        CatalogError::Pool(PoolError::AcquireTimeout(_)) | CatalogError::Pool(PoolError::ConnectionFailed(_)) => {
            degraded_response()
        }
        CatalogError::Pool(PoolError::Closed) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", "Server is shutting down")
        }
    }
}

/// Validated listing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub page_size: u32,
    pub category: Option<String>,
}

impl ListQuery {
    pub fn from_context(ctx: &RequestContext<'_>) -> Result<Self, String> {
        let page = match ctx.query("page") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(p) if p >= 1 => p,
                _ => return Err(format!("page must be a positive integer, got '{}'", raw)),
            },
            None => 1,
        };

        let page_size = match ctx.query("pageSize").or_else(|| ctx.query("limit")) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(s) if (1..=MAX_PAGE_SIZE).contains(&s) => s,
                _ => {
                    return Err(format!(
                        "pageSize must be between 1 and {}, got '{}'",
                        MAX_PAGE_SIZE, raw
                    ))
                }
            },
            None => DEFAULT_PAGE_SIZE,
        };

        let category = ctx
            .query("category")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(Self {
            page,
            page_size,
            category,
        })
    }
}

fn product_id(ctx: &RequestContext<'_>) -> Result<i64, Response<BoxBody>> {
    let raw = ctx.param("id").unwrap_or_default();
    raw.parse::<i64>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            &format!("Product id must be an integer, got '{}'", raw),
        )
    })
}

async fn fetch_page(ctx: &RequestContext<'_>) -> Result<ProductPage, Response<BoxBody>> {
    let query = ListQuery::from_context(ctx)
        .map_err(|msg| error_response(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", &msg))?;

    ctx.core
        .catalog()
        .read(|conn| list_products(conn, query.page, query.page_size, query.category.as_deref()))
        .await
        .map_err(|e| catalog_error_response(&e))
}

async fn fetch_product(ctx: &RequestContext<'_>) -> Result<Product, Response<BoxBody>> {
    let id = product_id(ctx)?;
    match ctx.core.catalog().read(|conn| get_product(conn, id)).await {
        Ok(Some(product)) => Ok(product),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            &format!("Product {} not found", id),
        )),
        Err(e) => Err(catalog_error_response(&e)),
    }
}

fn with_page_headers(mut response: Response<BoxBody>, page: &ProductPage) -> Response<BoxBody> {
    let headers = response.headers_mut();
    headers.insert("x-total-count", page.total.into());
    headers.insert("x-page", page.page.into());
    headers.insert("x-page-size", page.page_size.into());
    response
}

/// `GET /products` (v1)
pub struct ListProductsV1;

#[async_trait]
impl Handler for ListProductsV1 {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        match fetch_page(ctx).await {
            Ok(page) => {
                let body = json!({
                    "products": page.products,
                    "total": page.total,
                    "page": page.page,
                    "limit": page.page_size,
                    "totalPages": page.total_pages(),
                });
                with_page_headers(json_response(StatusCode::OK, &body), &page)
            }
            Err(response) => response,
        }
    }
}

/// `GET /products/:id` (v1)
pub struct GetProductV1;

#[async_trait]
impl Handler for GetProductV1 {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        match fetch_product(ctx).await {
            Ok(product) => json_response(StatusCode::OK, &product),
            Err(response) => response,
        }
    }
}

/// `GET /products` (v2)
pub struct ListProductsV2;

#[async_trait]
impl Handler for ListProductsV2 {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        match fetch_page(ctx).await {
            Ok(page) => {
                let total_pages = page.total_pages();
                let body = json!({
                    "data": page.products,
                    "pagination": {
                        "page": page.page,
                        "pageSize": page.page_size,
                        "total": page.total,
                        "totalPages": total_pages,
                        "hasMore": i64::from(page.page) < total_pages,
                    },
                });
                with_page_headers(json_response(StatusCode::OK, &body), &page)
            }
            Err(response) => response,
        }
    }
}

/// `GET /products/:id` (v2)
pub struct GetProductV2;

#[async_trait]
impl Handler for GetProductV2 {
    async fn handle(&self, ctx: &RequestContext<'_>) -> Response<BoxBody> {
        match fetch_product(ctx).await {
            Ok(product) => json_response(StatusCode::OK, &json!({ "data": product })),
            Err(response) => response,
        }
    }
}

pub fn v1_routes() -> RouteSet {
    RouteSet::new()
        .route(hyper::Method::GET, "/products", Arc::new(ListProductsV1))
        .route(hyper::Method::GET, "/products/:id", Arc::new(GetProductV1))
}

pub fn v2_routes() -> RouteSet {
    RouteSet::new()
        .route(hyper::Method::GET, "/products", Arc::new(ListProductsV2))
        .route(hyper::Method::GET, "/products/:id", Arc::new(GetProductV2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        seed_sample(&conn).unwrap();
        conn
    }

    #[test]
    fn test_list_products_paginates() {
        let conn = memory_db();
        let page = list_products(&conn, 2, 2, None).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.products.len(), 2);
        assert_eq!(page.products[0].id, 3);
        assert_eq!(page.total_pages(), 3);
    }

    #[test]
    fn test_list_products_filters_by_category() {
        let conn = memory_db();
        let page = list_products(&conn, 1, 100, Some("MINERALES")).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.products[0].name, "Magnesio Citrato");
    }

    #[test]
    fn test_category_wildcards_match_literally() {
        let conn = memory_db();
        conn.execute(
            "INSERT INTO products (name, price, stock, category) VALUES ('Mix', 1.0, 1, 'packs_50%')",
            [],
        )
        .unwrap();

        assert_eq!(list_products(&conn, 1, 100, Some("%")).unwrap().total, 1);
        assert_eq!(list_products(&conn, 1, 100, Some("_")).unwrap().total, 1);
        assert_eq!(list_products(&conn, 1, 100, Some("s_5")).unwrap().total, 1);
        assert_eq!(list_products(&conn, 1, 100, Some("\\")).unwrap().total, 0);
        assert_eq!(list_products(&conn, 1, 100, Some("vit_min")).unwrap().total, 0);
    }

    #[test]
    fn test_page_past_the_end_is_clamped() {
        let conn = memory_db();

        let page = list_products(&conn, 9, 2, None).unwrap();
        assert_eq!(page.page, 3);
        assert_eq!(page.products.len(), 1);
        assert_eq!(page.products[0].id, 5);

        let empty = list_products(&conn, 4, 10, Some("nothing")).unwrap();
        assert_eq!(empty.page, 1);
        assert!(empty.products.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_read_frees_probe_slot() {
        use crate::pool::{CircuitBreakerConfig, CircuitState, PoolConfig, SqliteConnector};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            max_connections: 1,
            idle_timeout: Duration::ZERO,
            path: dir.path().join("catalog.sqlite"),
            ..Default::default()
        };
        let pool = Arc::new(SqlitePool::new(config.clone(), SqliteConnector::from_config(&config)).unwrap());
        let breaker = Arc::new(CatalogBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            window: Duration::from_secs(30),
            open_timeout: Duration::from_secs(1),
            half_open_probes: 1,
        }));
        let service = CatalogService::new(Arc::clone(&pool), Some(Arc::clone(&breaker)));

        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        // The only connection is busy, so the probe read stalls and gets cancelled
        let held = pool.acquire().await.unwrap();
        let select_one = |conn: &Connection| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0));
        let stalled = tokio::time::timeout(Duration::from_millis(100), service.read(select_one)).await;
        assert!(stalled.is_err());
        drop(held);

        assert!(matches!(
            breaker.state(),
            CircuitState::HalfOpen {
                probe_in_flight: false,
                ..
            }
        ));

        assert_eq!(service.read(select_one).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_get_product() {
        let conn = memory_db();
        assert_eq!(get_product(&conn, 1).unwrap().unwrap().category, "vitaminas");
        assert!(get_product(&conn, 999).unwrap().is_none());
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
        let page = list_products(&conn, 1, 10, None).unwrap();
        assert_eq!(page.total, 5);
    }
}
