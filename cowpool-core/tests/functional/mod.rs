// vim: tw=80
mod draid;
mod label;
mod rebuild;
