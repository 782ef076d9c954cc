/// Declares a 128-bit id newtype that prints as a uuid. Used for ids that are either random
/// (`new_random`) or derived from a content hash (`from_u128`).
#[macro_export]
macro_rules! create_id_newtype {
    ($data_type:ident, $name:literal) => {
        #[derive(
            Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize,
        )]
        pub struct $data_type(u128);
        impl $data_type {
            pub const fn null() -> Self {
                Self(0)
            }

            pub fn new_random() -> Self {
                Self(uuid::Uuid::new_v4().as_u128())
            }

            pub fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid.as_u128())
            }

            pub fn as_uuid(self) -> uuid::Uuid {
                uuid::Uuid::from_u128(self.0)
            }

            pub const fn from_u128(u: u128) -> Self {
                Self(u)
            }

            pub const fn as_u128(self) -> u128 {
                self.0
            }

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl std::fmt::Debug for $data_type {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                f.debug_tuple($name)
                    .field(&uuid::Uuid::from_u128(self.0))
                    .finish()
            }
        }
    };
}
