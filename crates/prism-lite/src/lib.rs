pub mod lite;
