// SPDX-FileCopyrightText: Copyright © 2020-2023 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The two on-disk SQL stores: the metadata backing store ([`meta`]) and the
//! deployment/computer-sync store ([`deployment`]).

pub use self::encoding::{Decoder, Encoding};

pub mod deployment;
pub mod meta;

mod encoding {
    //! Decode from sql types to rust types, the same shape as a plain
    //! `FromRow` column but for types that don't map 1:1 onto a sql type.
    use sqlx::{Sqlite, Type};
    use thiserror::Error;

    use crate::deployment;
    use crate::package::PackageKind;

    /// Decode from a database type using [`Encoding::decode`].
    #[derive(Debug, Clone, Copy)]
    pub struct Decoder<T>(pub T);

    /// An encoding between a sql type and a rust type.
    pub trait Encoding<'a>: Sized {
        type Encoded: ToOwned;
        type Error;

        fn decode(encoded: Self::Encoded) -> Result<Self, Self::Error>;
        fn encode(&'a self) -> Self::Encoded;
    }

    impl<'r, T, U, E> sqlx::Decode<'r, Sqlite> for Decoder<T>
    where
        T: Encoding<'r, Encoded = U, Error = E>,
        U: sqlx::Decode<'r, Sqlite> + ToOwned,
        E: std::error::Error + Send + Sync + 'static,
    {
        fn decode(value: <Sqlite as sqlx::database::HasValueRef<'r>>::ValueRef) -> Result<Self, sqlx::error::BoxDynError> {
            Ok(T::decode(U::decode(value)?).map(Decoder)?)
        }
    }

    impl<T, U, E> Type<Sqlite> for Decoder<T>
    where
        T: Encoding<'static, Encoded = U, Error = E>,
        U: ToOwned + Type<Sqlite>,
    {
        fn type_info() -> <Sqlite as sqlx::Database>::TypeInfo {
            U::type_info()
        }

        fn compatible(ty: &<Sqlite as sqlx::Database>::TypeInfo) -> bool {
            U::compatible(ty)
        }
    }

    impl<'a> Encoding<'a> for PackageKind {
        type Encoded = &'a str;
        type Error = DecodePackageKindError;

        fn decode(value: &'a str) -> Result<Self, Self::Error> {
            match value {
                "software" => Ok(PackageKind::SoftwareUpdate),
                "driver" => Ok(PackageKind::DriverUpdate),
                "detectoid" => Ok(PackageKind::DetectoidCategory),
                "classification" => Ok(PackageKind::ClassificationCategory),
                "product" => Ok(PackageKind::ProductCategory),
                other => Err(DecodePackageKindError(other.to_string())),
            }
        }

        fn encode(&self) -> &'a str {
            match self {
                PackageKind::SoftwareUpdate => "software",
                PackageKind::DriverUpdate => "driver",
                PackageKind::DetectoidCategory => "detectoid",
                PackageKind::ClassificationCategory => "classification",
                PackageKind::ProductCategory => "product",
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("invalid package kind: {0}")]
    pub struct DecodePackageKindError(String);

    impl<'a> Encoding<'a> for deployment::Action {
        type Encoded = &'a str;
        type Error = DecodeActionError;

        fn decode(value: &'a str) -> Result<Self, Self::Error> {
            match value {
                "Install" => Ok(deployment::Action::Install),
                "Bundle" => Ok(deployment::Action::Bundle),
                "Evaluate" => Ok(deployment::Action::Evaluate),
                "PreDeploymentCheck" => Ok(deployment::Action::PreDeploymentCheck),
                other => Err(DecodeActionError(other.to_string())),
            }
        }

        fn encode(&self) -> &'a str {
            match self {
                deployment::Action::Install => "Install",
                deployment::Action::Bundle => "Bundle",
                deployment::Action::Evaluate => "Evaluate",
                deployment::Action::PreDeploymentCheck => "PreDeploymentCheck",
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("invalid deployment action: {0}")]
    pub struct DecodeActionError(String);
}
