use std::fmt;

use crate::types::{ColumnId, StreamId};

/// Executable statements grouped into transactions.
///
/// Each inner list is executed as one transaction, transactions are executed in order. Empty
/// statements and empty transactions are dropped on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sql {
    transactions: Vec<Vec<String>>,
}

impl Sql {
    /// A single statement in its own transaction.
    pub fn of(statement: impl Into<String>) -> Self {
        Self::transactionally([statement])
    }

    /// Every statement in its own transaction.
    pub fn separately<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transactions = statements
            .into_iter()
            .map(Into::into)
            .filter(|statement: &String| !statement.trim().is_empty())
            .map(|statement| vec![statement])
            .collect();

        Self { transactions }
    }

    /// All statements in one transaction.
    pub fn transactionally<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transaction: Vec<String> = statements
            .into_iter()
            .map(Into::into)
            .filter(|statement| !statement.trim().is_empty())
            .collect();

        if transaction.is_empty() {
            return Self::default();
        }

        Self {
            transactions: vec![transaction],
        }
    }

    /// Concatenates the transactions of several [`Sql`] values, preserving order.
    pub fn concat<I>(sqls: I) -> Self
    where
        I: IntoIterator<Item = Sql>,
    {
        let transactions = sqls
            .into_iter()
            .flat_map(|sql| sql.transactions)
            .collect();

        Self { transactions }
    }

    pub fn transactions(&self) -> &[Vec<String>] {
        &self.transactions
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl fmt::Display for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, transaction) in self.transactions.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", transaction.join(";\n"))?;
        }

        Ok(())
    }
}

/// Dialect-specific naming and DDL generation.
///
/// Implementations must be pure, generating the same output for the same input without touching
/// the destination, so that generated statements can be retried freely.
pub trait SqlGenerator: Send + Sync {
    /// Builds the destination identity of a stream.
    fn build_stream_id(&self, namespace: &str, name: &str, raw_namespace: &str) -> StreamId;

    /// Builds the destination identity of a column.
    fn build_column_id(&self, name: &str) -> ColumnId;

    /// Creates `namespace` if it does not exist.
    fn create_schema(&self, namespace: &str) -> Sql;
}
