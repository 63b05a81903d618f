// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the granules crates.

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Macro for creating parametrized *synchronous* tests.
///
/// Accepts the name of an existing function, followed by a list of case names
/// and their arguments, and expands to a module with one `#[test]` per case.
///
/// # Examples
///
/// ```
/// # use granules_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Macro for creating parametrized *asynchronous* tests.
///
/// Like [`param_test!`], but for `async` functions. The attribute supplied on
/// each expansion must provide the async test runner, e.g. `#[tokio::test]`.
///
/// # Examples
///
/// ```
/// # use granules_test_utils::async_param_test;
/// #
/// async_param_test! {
///     #[tokio::test]
///     test_sum: [
///         positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8),
///     ]
/// }
/// async fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! async_param_test {
    ($(#[$attrs:meta])+ $func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                $(#[$attrs])+
                $(#[$outer])*
                async fn $case_name() -> $return_ty {
                    $func_name($($args),*).await
                }
            )*
        }
    };
    ($(#[$attrs:meta])+ $func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::async_param_test!(
            $(#[$attrs])+ $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}
