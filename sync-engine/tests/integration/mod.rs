mod migrations_test;
mod pipeline_test;
