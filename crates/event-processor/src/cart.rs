//! 购物车服务读网关
//!
//! ORDER_CREATED 事件未内嵌行项目时，通过 HTTP 回查购物车服务获取。
//! 回查是只读操作，瞬时失败按策略重试；清空购物车走事件通道，不在此处。

use async_trait::async_trait;
use storefront_shared::config::CartServiceConfig;
use storefront_shared::error::ShopError;
use storefront_shared::events::OrderLine;
use storefront_shared::retry::{RetryPolicy, retry_with_policy};
use tracing::debug;

/// 购物车读接口
#[async_trait]
pub trait CartService: Send + Sync {
    /// 获取用户当前购物车的行项目
    async fn fetch_items(&self, user_id: &str) -> Result<Vec<OrderLine>, ShopError>;
}

// ---------------------------------------------------------------------------
// HttpCartService
// ---------------------------------------------------------------------------

/// 基于 HTTP 的购物车服务客户端
pub struct HttpCartService {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpCartService {
    pub fn new(config: &CartServiceConfig) -> Result<Self, ShopError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ShopError::ExternalService {
                service: "cart-service".to_string(),
                message: format!("创建 HTTP 客户端失败: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }
}

#[async_trait]
impl CartService for HttpCartService {
    async fn fetch_items(&self, user_id: &str) -> Result<Vec<OrderLine>, ShopError> {
        let url = format!("{}/api/cart/{}/items", self.base_url, user_id);

        let items = retry_with_policy(
            &self.retry,
            "fetch_cart_items",
            ShopError::is_retryable,
            || {
                let client = self.client.clone();
                let url = url.clone();
                async move {
                    let response =
                        client
                            .get(&url)
                            .send()
                            .await
                            .map_err(|e| ShopError::ExternalService {
                                service: "cart-service".to_string(),
                                message: format!("请求失败: {e}"),
                            })?;

                    if !response.status().is_success() {
                        return Err(ShopError::ExternalService {
                            service: "cart-service".to_string(),
                            message: format!("状态码 {}", response.status()),
                        });
                    }

                    response.json::<Vec<OrderLine>>().await.map_err(|e| {
                        // 响应体格式不对说明接口契约被破坏，重试无意义
                        ShopError::Serialization(format!("解析购物车响应失败: {e}"))
                    })
                }
            },
        )
        .await?;

        debug!(user_id, count = items.len(), "已回查购物车行项目");
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// FixedCartService — 测试用
// ---------------------------------------------------------------------------

/// 返回固定行项目的购物车实现（测试用）
#[derive(Default)]
pub struct FixedCartService {
    items: Vec<OrderLine>,
}

impl FixedCartService {
    /// 购物车为空
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<OrderLine>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl CartService for FixedCartService {
    async fn fetch_items(&self, _user_id: &str) -> Result<Vec<OrderLine>, ShopError> {
        Ok(self.items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_cart_service_returns_seeded_items() {
        let line = OrderLine {
            product_id: "prod-001".to_string(),
            product_name: "帆布鞋".to_string(),
            product_price: 199.0,
            product_image: None,
            quantity: 1,
            size: None,
            color: None,
        };
        let cart = FixedCartService::with_items(vec![line.clone()]);

        let items = cart.fetch_items("user-001").await.unwrap();
        assert_eq!(items, vec![line]);

        let empty = FixedCartService::empty();
        assert!(empty.fetch_items("user-001").await.unwrap().is_empty());
    }
}
