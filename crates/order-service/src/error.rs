//! 订单服务错误类型

use thiserror::Error;

/// 订单服务错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("订单不存在: {0}")]
    NotFound(i64),

    #[error("订单数据无效: {0}")]
    InvalidOrder(String),
}

pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(OrderError::NotFound(42).to_string(), "订单不存在: 42");
        assert_eq!(
            OrderError::InvalidOrder("订单没有任何菜品".to_string()).to_string(),
            "订单数据无效: 订单没有任何菜品"
        );
    }
}
