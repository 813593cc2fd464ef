pub mod category;
pub mod money;

pub use category::ExpenseCategory;
pub use money::{Money, MoneyError};
