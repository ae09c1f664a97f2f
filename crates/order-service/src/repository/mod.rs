//! 订单仓储
//!
//! 服务层依赖 `OrderStore` 抽象，便于替换存储实现并支持 mock 测试。

pub mod memory;
pub mod traits;

pub use memory::MemoryOrderStore;
pub use traits::OrderStore;

#[cfg(test)]
pub use traits::MockOrderStore;
